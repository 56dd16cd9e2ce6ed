//! HTTP API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{Method, StatusCode},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::ApiError;
use crate::relay::Relay;
use crate::status::StatusSnapshot;

/// Create the API router.
pub fn create_router(relay: Arc<Relay>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    Router::new()
        .route("/api/register", get(register))
        .route("/api/unregister", get(unregister))
        .route("/api/numquotes", get(num_quotes))
        .route("/api/quotes", get(quotes))
        .route("/api/status", get(status))
        .layer(cors)
        .with_state(relay)
}

#[derive(Deserialize)]
struct RegistrationQuery {
    token: Option<String>,
    did: Option<String>,
}

impl RegistrationQuery {
    fn into_parts(self) -> Result<(String, String), ApiError> {
        let did = non_empty(self.did).ok_or(ApiError::MissingParam("did"))?;
        let token = non_empty(self.token).ok_or(ApiError::MissingParam("token"))?;
        Ok((did, token))
    }
}

#[derive(Deserialize)]
struct UrisQuery {
    #[serde(default)]
    uri: Vec<String>,
}

#[derive(Deserialize)]
struct UriQuery {
    uri: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

async fn register(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<RegistrationQuery>,
) -> Result<StatusCode, ApiError> {
    let (did, token) = query.into_parts()?;
    relay.register(&did, &token)?;
    Ok(StatusCode::OK)
}

async fn unregister(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<RegistrationQuery>,
) -> Result<StatusCode, ApiError> {
    let (did, token) = query.into_parts()?;
    relay.unregister(&did, &token)?;
    Ok(StatusCode::OK)
}

/// `?uri=a&uri=b` -> `{"a": n, "b": m}`.
async fn num_quotes(
    State(relay): State<Arc<Relay>>,
    axum_extra::extract::Query(query): axum_extra::extract::Query<UrisQuery>,
) -> Json<BTreeMap<String, usize>> {
    Json(relay.quotes().counts(query.uri.iter().map(String::as_str)))
}

async fn quotes(
    State(relay): State<Arc<Relay>>,
    Query(query): Query<UriQuery>,
) -> Result<Json<Vec<String>>, ApiError> {
    let uri = non_empty(query.uri).ok_or(ApiError::MissingParam("uri"))?;
    Ok(Json(relay.quotes().quotes(&uri)))
}

async fn status(State(relay): State<Arc<Relay>>) -> Json<StatusSnapshot> {
    Json(relay.status())
}
