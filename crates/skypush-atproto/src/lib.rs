//! ATProto firehose consumption for skypush.
//!
//! ## Features
//!
//! - **Firehose**: reconnecting `subscribeRepos` client with a liveness watchdog
//! - **Frames**: dual-CBOR frame and CAR block decoding into [`RepoCommit`]s
//! - **Records**: typed likes, posts, reposts and follows
//! - **Classification**: commits turned into [`FirehoseEvent`]s

pub mod car;
mod classify;
mod error;
pub mod firehose;
mod frame;
mod records;
mod uri;

pub use classify::{EventKind, FirehoseEvent, classify_commit, classify_operation};
pub use error::AtprotoError;
pub use firehose::{
    ConnectionState, Connector, FirehoseClient, FirehoseConfig, FirehoseMonitor, FirehoseStats,
    FrameStream, StreamError, WebSocketConnector,
};
pub use frame::{Frame, OpAction, RepoCommit, RepoOperation, decode_frame};
pub use records::*;
pub use uri::{AtUri, AtUriError};
