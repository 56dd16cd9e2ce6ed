//! Error types for the store.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur when opening or writing a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error on the backing file.
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A line in the log could not be parsed.
    #[error("corrupt log line {line} in {path}: {content:?}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// A key or value the log format cannot hold.
    #[error("{field} cannot be stored: {entry:?}")]
    InvalidEntry { field: &'static str, entry: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
