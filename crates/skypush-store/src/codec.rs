//! Reversible key/value transforms applied before persistence.

use std::borrow::Cow;

/// Escape character marking a compressed (or escaped) string.
const MARKER: char = '~';

/// Maximum number of prefixes a [`PrefixCodec`] can hold (one digit each).
const MAX_PREFIXES: usize = 10;

/// A reversible transform applied to every key and value a store sees.
///
/// Implementations must satisfy `uncompress(compress(x)) == x` for every
/// string `x`.
pub trait Codec: Send + Sync {
    /// Shrink a string before it is stored.
    fn compress<'a>(&self, input: &'a str) -> Cow<'a, str>;

    /// Restore a string produced by [`Codec::compress`].
    fn uncompress<'a>(&self, input: &'a str) -> Cow<'a, str>;
}

/// Codec that stores everything verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn compress<'a>(&self, input: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(input)
    }

    fn uncompress<'a>(&self, input: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(input)
    }
}

/// Codec replacing well-known prefixes with a two-character marker.
///
/// A string beginning with prefix `n` is stored as `~n<rest>`. Strings that
/// already begin with `~` are escaped as `~~<rest>` so decoding stays
/// unambiguous. When several prefixes match, the longest wins.
///
/// ```
/// use skypush_store::{Codec, PrefixCodec};
///
/// let codec = PrefixCodec::atproto();
/// let stored = codec.compress("at://did:plc:abc/app.bsky.feed.post/3k");
/// assert_eq!(stored, "~0abc/app.bsky.feed.post/3k");
/// assert_eq!(codec.uncompress(&stored), "at://did:plc:abc/app.bsky.feed.post/3k");
/// ```
#[derive(Debug, Clone)]
pub struct PrefixCodec {
    prefixes: Vec<String>,
}

impl PrefixCodec {
    /// Build a codec from an ordered prefix list.
    ///
    /// Only the first ten non-empty prefixes are used; each is addressed by
    /// its position.
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes = prefixes
            .into_iter()
            .map(Into::into)
            .filter(|p: &String| !p.is_empty())
            .take(MAX_PREFIXES)
            .collect();
        Self { prefixes }
    }

    /// Prefixes that dominate AT Protocol identifiers and record URIs.
    pub fn atproto() -> Self {
        Self::new([
            "at://did:plc:",
            "did:plc:",
            "at://did:web:",
            "did:web:",
            "ExponentPushToken[",
        ])
    }

    fn longest_match(&self, input: &str) -> Option<(usize, &str)> {
        self.prefixes
            .iter()
            .enumerate()
            .filter(|(_, p)| input.starts_with(p.as_str()))
            .max_by_key(|(_, p)| p.len())
            .map(|(i, p)| (i, p.as_str()))
    }
}

impl Codec for PrefixCodec {
    fn compress<'a>(&self, input: &'a str) -> Cow<'a, str> {
        if input.starts_with(MARKER) {
            return Cow::Owned(format!("{MARKER}{input}"));
        }
        match self.longest_match(input) {
            Some((index, prefix)) => {
                Cow::Owned(format!("{MARKER}{index}{}", &input[prefix.len()..]))
            }
            None => Cow::Borrowed(input),
        }
    }

    fn uncompress<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let Some(rest) = input.strip_prefix(MARKER) else {
            return Cow::Borrowed(input);
        };
        if rest.starts_with(MARKER) {
            return Cow::Borrowed(rest);
        }
        let mut chars = rest.chars();
        let prefix = chars
            .next()
            .and_then(|c| c.to_digit(10))
            .and_then(|d| self.prefixes.get(d as usize));
        match prefix {
            Some(prefix) => Cow::Owned(format!("{prefix}{}", chars.as_str())),
            // Not produced by this codec; hand it back untouched.
            None => Cow::Borrowed(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("at://did:plc:abc/app.bsky.feed.post/3k", "~0abc/app.bsky.feed.post/3k" ; "quote uri")]
    #[test_case("did:plc:abc", "~1abc" ; "plc did")]
    #[test_case("did:web:example.com", "~3example.com" ; "web did")]
    #[test_case("ExponentPushToken[xyz]", "~4xyz]" ; "expo token")]
    #[test_case("plain-token", "plain-token" ; "no prefix")]
    #[test_case("~leading", "~~leading" ; "escaped marker")]
    #[test_case("", "" ; "empty")]
    fn test_compress_known_values(input: &str, stored: &str) {
        let codec = PrefixCodec::atproto();
        assert_eq!(codec.compress(input), stored);
        assert_eq!(codec.uncompress(stored), input);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let codec = PrefixCodec::new(["at://", "at://did:plc:"]);
        assert_eq!(codec.compress("at://did:plc:x"), "~1x");
        assert_eq!(codec.compress("at://did:web:x"), "~0did:web:x");
    }

    #[test]
    fn test_uncompress_unknown_marker_is_passthrough() {
        let codec = PrefixCodec::new(["did:plc:"]);
        assert_eq!(codec.uncompress("~7abc"), "~7abc");
        assert_eq!(codec.uncompress("~"), "~");
    }

    #[test]
    fn test_empty_prefixes_are_ignored() {
        let codec = PrefixCodec::new(["", "did:"]);
        assert_eq!(codec.compress("did:x"), "~0x");
    }

    #[test]
    fn test_identity_codec() {
        assert_eq!(IdentityCodec.compress("~0abc"), "~0abc");
        assert_eq!(IdentityCodec.uncompress("~0abc"), "~0abc");
    }

    proptest! {
        #[test]
        fn prop_prefix_codec_round_trips(input in "(~|at://did:plc:|did:plc:|did:web:|ExponentPushToken\\[)?[~0-9a-zA-Z:/._\\[\\]-]{0,40}") {
            let codec = PrefixCodec::atproto();
            let stored = codec.compress(&input).into_owned();
            prop_assert_eq!(codec.uncompress(&stored), input.as_str());
        }

        #[test]
        fn prop_prefix_codec_round_trips_any_string(input in "\\PC{0,32}") {
            let codec = PrefixCodec::atproto();
            let stored = codec.compress(&input).into_owned();
            prop_assert_eq!(codec.uncompress(&stored), input.as_str());
        }
    }
}
