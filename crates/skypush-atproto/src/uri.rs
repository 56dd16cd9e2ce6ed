//! AT URI parsing utilities.

use std::fmt;

use thiserror::Error;

/// Error when parsing an AT URI.
#[derive(Debug, Error)]
#[error("invalid AT URI: {0}")]
pub struct AtUriError(String);

/// A parsed AT Protocol URI.
///
/// AT URIs have the format: `at://{did}/{collection}/{rkey}`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// The DID of the repository owner.
    pub did: String,
    /// The collection (e.g., "app.bsky.feed.post").
    pub collection: String,
    /// The record key.
    pub rkey: String,
}

impl AtUri {
    /// Build the URI of a record in `did`'s repository.
    pub fn new(did: impl Into<String>, collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        }
    }

    /// Parse an AT URI string.
    ///
    /// # Example
    ///
    /// ```
    /// use skypush_atproto::AtUri;
    ///
    /// let uri = AtUri::parse("at://did:plc:abc123/app.bsky.feed.post/3abc").unwrap();
    /// assert_eq!(uri.did, "did:plc:abc123");
    /// assert_eq!(uri.collection, "app.bsky.feed.post");
    /// assert_eq!(uri.rkey, "3abc");
    /// ```
    pub fn parse(uri: &str) -> Result<Self, AtUriError> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| AtUriError(format!("missing at:// prefix: {uri}")))?;

        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() != 3 {
            return Err(AtUriError(format!("expected did/collection/rkey: {uri}")));
        }

        let parsed = Self::new(parts[0], parts[1], parts[2]);
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that every component is non-empty and free of whitespace and
    /// control characters.
    pub fn validate(&self) -> Result<(), AtUriError> {
        for part in [&self.did, &self.collection, &self.rkey] {
            if part.is_empty() {
                return Err(AtUriError(format!("empty component in URI: {self}")));
            }
            if part.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(AtUriError(format!("invalid character in URI: {:?}", self.to_string())));
            }
        }
        Ok(())
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}
