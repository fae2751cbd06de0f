//! Relay registration HTTP API.
//!
//! - `POST /api/relay/register` — allocate a subdomain + token (`201`)
//! - `POST /api/relay/refresh`  — validate a stored token (`200` / `401`)
//! - `GET  /health`             — liveness probe
//!
//! Registration takes no credentials: possession of the returned token is the
//! only proof of subdomain ownership, so tokens must never appear in logs.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::RelayState;

/// Build the relay router: registration API plus the WebSocket endpoints.
pub fn relay_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/relay/register", post(register))
        .route("/api/relay/refresh", post(refresh))
        .route("/relay", get(super::ws::tunnel_ws))
        .route("/ws", get(super::ws::client_ws))
        .with_state(state)
}

/// `GET /health` — liveness probe, no auth.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Request body for `POST /api/relay/register`. The body is optional; an
/// empty or invalid body registers with an unknown client version.
#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    client_version: String,
}

/// `POST /api/relay/register` — mint a fresh `(subdomain, relay_token)` pair.
async fn register(
    State(state): State<RelayState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let (subdomain, relay_token) = state.register().await;

    info!(subdomain = %subdomain, client_version = %req.client_version, "Registered workstation");

    (
        StatusCode::CREATED,
        Json(json!({
            "subdomain": subdomain,
            "relay_token": relay_token,
            "relay_server": state.domain,
        })),
    )
        .into_response()
}

/// Request body for `POST /api/relay/refresh`.
#[derive(Debug, Deserialize)]
struct RefreshRequest {
    relay_token: String,
}

/// `POST /api/relay/refresh` — confirm a stored token still maps to its
/// subdomain. `401` on unknown token, `400` on a missing one.
async fn refresh(
    State(state): State<RelayState>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Response {
    let Ok(Json(req)) = body else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "relay_token is required"})),
        )
            .into_response();
    };
    if req.relay_token.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "relay_token is required"})),
        )
            .into_response();
    }

    match state.refresh(&req.relay_token).await {
        Some(subdomain) => Json(json!({
            "subdomain": subdomain,
            "relay_server": state.domain,
            "status": "ok",
        }))
        .into_response(),
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid relay token"})),
        )
            .into_response(),
    }
}
