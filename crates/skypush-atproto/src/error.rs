//! Error types for firehose consumption.

use thiserror::Error;

/// Errors that can occur while consuming the ATProto firehose.
#[derive(Debug, Error)]
pub enum AtprotoError {
    /// CAR parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// CBOR decoding error.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// A record was present but did not match its declared `$type`.
    #[error("invalid {record_type} record: {message}")]
    InvalidRecord {
        record_type: String,
        message: String,
    },

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The upstream sent an error frame.
    #[error("firehose error frame: {error}{}", message.as_deref().map(|m| format!(" - {m}")).unwrap_or_default())]
    ErrorFrame {
        error: String,
        message: Option<String>,
    },

    /// No message arrived within the watchdog interval.
    #[error("no message received for {0}s")]
    Stale(u64),

    /// The upstream closed the stream.
    #[error("stream closed by upstream")]
    Closed,
}
