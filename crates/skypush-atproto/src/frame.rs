//! Firehose frame decoding.
//!
//! Every binary WebSocket message from `com.atproto.sync.subscribeRepos` is
//! two CBOR values back to back: a small header (`op`, `t`) and a payload
//! whose shape depends on `t`. Only `#commit` payloads are decoded into
//! [`RepoCommit`]s; operations inside a commit are decoded one at a time so a
//! single bad record never drops its siblings.

use std::io::Cursor;

use serde::Deserialize;
use tracing::{debug, trace};

use crate::car::read_blocks;
use crate::records::{Record, is_tracked_collection};
use crate::AtprotoError;

/// Action of a repository operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A decoded operation on a tracked collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOperation {
    pub action: OpAction,
    pub collection: String,
    pub rkey: String,
    /// The decoded record; `None` for deletes.
    pub record: Option<Record>,
}

/// A decoded `#commit` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoCommit {
    /// Upstream sequence number.
    pub seq: i64,
    /// DID of the repository the commit belongs to.
    pub repo: String,
    /// Operations on tracked collections, in commit order.
    pub ops: Vec<RepoOperation>,
    /// Operations that were dropped because their record failed to decode.
    pub skipped_ops: usize,
}

/// A decoded firehose frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Commit(RepoCommit),
    Info {
        name: Option<String>,
        message: Option<String>,
    },
    /// An `op == -1` error frame.
    Error {
        error: Option<String>,
        message: Option<String>,
    },
    /// A frame type the relay has no use for (`#identity`, `#account`, ...).
    Ignored(Option<String>),
}

/// Firehose frame header (first CBOR value in each message).
#[derive(Debug, Deserialize)]
struct FrameHeader {
    /// Operation: 1 = message, -1 = error
    op: i32,
    /// Message type (e.g., "#commit", "#identity")
    t: Option<String>,
}

/// Decode the frame header and return it along with the offset to the payload.
fn decode_frame_header(data: &[u8]) -> Result<(FrameHeader, usize), AtprotoError> {
    // ciborium stops reading at the end of the first value, which tells us
    // where the payload starts.
    let mut cursor = Cursor::new(data);
    let header: FrameHeader = ciborium::from_reader(&mut cursor)
        .map_err(|e| AtprotoError::CborDecode(format!("failed to decode frame header: {}", e)))?;
    let offset = cursor.position() as usize;
    Ok((header, offset))
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    #[serde(default)]
    seq: i64,
    repo: String,
    #[serde(with = "serde_bytes", default)]
    blocks: Option<Vec<u8>>,
    #[serde(default)]
    ops: Vec<RepoOpPayload>,
}

#[derive(Debug, Deserialize)]
struct RepoOpPayload {
    action: String,
    path: String,
    cid: Option<ipld_core::cid::Cid>,
}

#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
struct InfoPayload {
    name: Option<String>,
    message: Option<String>,
}

/// Error payload from firehose (op=-1 frames).
#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

/// Decode one binary firehose message.
pub async fn decode_frame(data: &[u8]) -> Result<Frame, AtprotoError> {
    let (header, offset) = decode_frame_header(data)?;
    let payload = &data[offset..];

    match (header.op, header.t.as_deref()) {
        (-1, _) => {
            let err: ErrorPayload = serde_ipld_dagcbor::from_slice(payload).map_err(|e| {
                AtprotoError::CborDecode(format!("failed to decode error frame: {}", e))
            })?;
            Ok(Frame::Error {
                error: err.error,
                message: err.message,
            })
        }
        (1, Some("#commit")) => {
            let commit: CommitPayload = serde_ipld_dagcbor::from_slice(payload).map_err(|e| {
                AtprotoError::CborDecode(format!("failed to decode commit event: {}", e))
            })?;
            decode_commit(commit).await.map(Frame::Commit)
        }
        (1, Some("#info")) => {
            let info: InfoPayload = serde_ipld_dagcbor::from_slice(payload).map_err(|e| {
                AtprotoError::CborDecode(format!("failed to decode info event: {}", e))
            })?;
            Ok(Frame::Info {
                name: info.name,
                message: info.message,
            })
        }
        (_, t) => Ok(Frame::Ignored(t.map(str::to_string))),
    }
}

/// Parse a record path into collection and rkey.
/// Returns None if the path is malformed (empty components).
fn parse_record_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.split('/');
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty())?;
    Some((collection, rkey))
}

async fn decode_commit(commit: CommitPayload) -> Result<RepoCommit, AtprotoError> {
    let mut result = RepoCommit {
        seq: commit.seq,
        repo: commit.repo,
        ops: Vec::new(),
        skipped_ops: 0,
    };

    let tracked: Vec<(OpAction, &str, &str, Option<String>)> = commit
        .ops
        .iter()
        .filter_map(|op| {
            let (collection, rkey) = parse_record_path(&op.path)?;
            if !is_tracked_collection(collection) {
                return None;
            }
            let Some(action) = OpAction::parse(&op.action) else {
                trace!(action = %op.action, "unknown op action");
                return None;
            };
            Some((action, collection, rkey, op.cid.as_ref().map(|c| c.to_string())))
        })
        .collect();

    if tracked.is_empty() {
        return Ok(result);
    }

    let needs_blocks = tracked.iter().any(|(action, ..)| *action != OpAction::Delete);
    let blocks = match (&commit.blocks, needs_blocks) {
        (Some(data), true) => read_blocks(data).await?,
        _ => Default::default(),
    };

    for (action, collection, rkey, cid) in tracked {
        if action == OpAction::Delete {
            result.ops.push(RepoOperation {
                action,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                record: None,
            });
            continue;
        }

        let Some(data) = cid.as_ref().and_then(|cid| blocks.get(cid)) else {
            debug!(repo = %result.repo, collection, rkey, "record block missing from commit");
            result.skipped_ops += 1;
            continue;
        };

        match Record::decode(data) {
            Ok(Some(record)) => result.ops.push(RepoOperation {
                action,
                collection: collection.to_string(),
                rkey: rkey.to_string(),
                record: Some(record),
            }),
            Ok(None) => {
                trace!(collection, rkey, "record has an untracked $type");
            }
            Err(e) => {
                debug!(repo = %result.repo, collection, rkey, error = %e, "skipping undecodable record");
                result.skipped_ops += 1;
            }
        }
    }

    Ok(result)
}
