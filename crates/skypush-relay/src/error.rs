//! Error types for the relay.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use skypush_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Errors that can occur in the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown did: {0}")]
    UnknownDid(String),
}

/// Errors returned by the HTTP API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::MissingParam(_)
            | ApiError::Relay(RelayError::UnknownDid(_))
            | ApiError::Relay(RelayError::Store(StoreError::InvalidEntry { .. })) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Relay(e) => {
                error!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
