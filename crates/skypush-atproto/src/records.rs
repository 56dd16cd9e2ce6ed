//! Bluesky record types the relay understands.
//!
//! Records arrive as DAG-CBOR blobs tagged with a `$type` discriminator.
//! [`Record::decode`] reads the discriminator first and then decodes only the
//! fields the classifier needs, so unknown fields (image blobs, labels, langs)
//! never cause a failure.

use serde::Deserialize;

use crate::AtprotoError;

// =============================================================================
// Bluesky Collection Constants
// =============================================================================

/// Bluesky follow records.
pub const FOLLOW_COLLECTION: &str = "app.bsky.graph.follow";

/// Bluesky like records.
pub const LIKE_COLLECTION: &str = "app.bsky.feed.like";

/// Bluesky repost records.
pub const REPOST_COLLECTION: &str = "app.bsky.feed.repost";

/// Bluesky post records.
pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Rich-text facet feature mentioning an account.
pub const MENTION_FEATURE: &str = "app.bsky.richtext.facet#mention";

/// Embed of another record (a quote post).
pub const RECORD_EMBED: &str = "app.bsky.embed.record";

/// Embed of another record alongside images or video.
pub const RECORD_WITH_MEDIA_EMBED: &str = "app.bsky.embed.recordWithMedia";

/// Whether the relay decodes records from `collection`.
pub fn is_tracked_collection(collection: &str) -> bool {
    matches!(
        collection,
        LIKE_COLLECTION | POST_COLLECTION | REPOST_COLLECTION | FOLLOW_COLLECTION
    )
}

/// A reference to another record. The CID is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RecordRef {
    pub uri: Option<String>,
}

/// Bluesky like record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Like {
    pub subject: Option<RecordRef>,
}

/// Bluesky repost record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Repost {
    pub subject: Option<RecordRef>,
}

/// Bluesky follow record. The subject is the followed DID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Follow {
    pub subject: Option<String>,
}

/// Reply pointers of a post.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplyRef {
    pub root: Option<RecordRef>,
    pub parent: Option<RecordRef>,
}

impl ReplyRef {
    /// URI of the post being replied to: the parent, else the thread root.
    pub fn target_uri(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|r| r.uri.as_deref())
            .or_else(|| self.root.as_ref().and_then(|r| r.uri.as_deref()))
    }
}

/// A rich-text facet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Facet {
    #[serde(default)]
    pub features: Vec<FacetFeature>,
}

/// A facet feature, reduced to the variants the relay acts on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawFacetFeature")]
pub enum FacetFeature {
    Mention { did: String },
    Other,
}

#[derive(Deserialize)]
struct RawFacetFeature {
    #[serde(rename = "$type")]
    feature_type: Option<String>,
    did: Option<String>,
}

impl From<RawFacetFeature> for FacetFeature {
    fn from(raw: RawFacetFeature) -> Self {
        match (raw.feature_type.as_deref(), raw.did) {
            (Some(MENTION_FEATURE), Some(did)) if !did.is_empty() => Self::Mention { did },
            _ => Self::Other,
        }
    }
}

/// A post embed, reduced to whether it quotes another record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawEmbed")]
pub enum Embed {
    /// `app.bsky.embed.record` or `app.bsky.embed.recordWithMedia`.
    Quote { uri: String },
    Other,
}

#[derive(Deserialize)]
struct RawEmbed {
    #[serde(rename = "$type")]
    embed_type: Option<String>,
    record: Option<RawEmbedRecord>,
}

/// `record` is a strong ref in `embed.record` and a nested
/// `{record: strongRef}` in `embed.recordWithMedia`.
#[derive(Deserialize)]
struct RawEmbedRecord {
    uri: Option<String>,
    record: Option<RecordRef>,
}

impl From<RawEmbed> for Embed {
    fn from(raw: RawEmbed) -> Self {
        let uri = match (raw.embed_type.as_deref(), raw.record) {
            (Some(RECORD_EMBED), Some(record)) => record.uri,
            (Some(RECORD_WITH_MEDIA_EMBED), Some(record)) => record.record.and_then(|r| r.uri),
            _ => None,
        };
        match uri {
            Some(uri) if !uri.is_empty() => Self::Quote { uri },
            _ => Self::Other,
        }
    }
}

/// Bluesky post record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Post {
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub facets: Vec<Facet>,
    pub embed: Option<Embed>,
}

impl Post {
    /// DIDs mentioned in the post's facets, deduplicated, in order.
    pub fn mentioned_dids(&self) -> Vec<&str> {
        let mut dids: Vec<&str> = Vec::new();
        for feature in self.facets.iter().flat_map(|f| &f.features) {
            if let FacetFeature::Mention { did } = feature
                && !dids.contains(&did.as_str())
            {
                dids.push(did.as_str());
            }
        }
        dids
    }

    /// URI of the quoted record, if the post embeds one.
    pub fn quoted_uri(&self) -> Option<&str> {
        match &self.embed {
            Some(Embed::Quote { uri }) => Some(uri.as_str()),
            _ => None,
        }
    }
}

/// A decoded record of a type the relay understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Like(Like),
    Post(Post),
    Repost(Repost),
    Follow(Follow),
}

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "$type")]
    record_type: Option<String>,
}

impl Record {
    /// Decode a DAG-CBOR record.
    ///
    /// Returns `Ok(None)` for records whose `$type` is missing or not one of
    /// the tracked Bluesky types.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, AtprotoError> {
        let probe: TypeProbe = serde_ipld_dagcbor::from_slice(data)
            .map_err(|e| AtprotoError::CborDecode(format!("failed to decode record: {e}")))?;

        let Some(record_type) = probe.record_type else {
            return Ok(None);
        };

        let record = match record_type.as_str() {
            LIKE_COLLECTION => Self::Like(decode_as(&record_type, data)?),
            POST_COLLECTION => Self::Post(decode_as(&record_type, data)?),
            REPOST_COLLECTION => Self::Repost(decode_as(&record_type, data)?),
            FOLLOW_COLLECTION => Self::Follow(decode_as(&record_type, data)?),
            _ => return Ok(None),
        };
        Ok(Some(record))
    }
}

fn decode_as<T: serde::de::DeserializeOwned>(
    record_type: &str,
    data: &[u8],
) -> Result<T, AtprotoError> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| AtprotoError::InvalidRecord {
        record_type: record_type.to_string(),
        message: e.to_string(),
    })
}
