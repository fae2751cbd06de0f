//! Pre-shared token authentication for the local REST surface.
//!
//! Every `/api/*` route except the WebSocket upgrade requires the configured
//! `AUTH_TOKEN`, either as `Authorization: Bearer <token>` or as a `?token=`
//! query parameter (mobile WebView downloads can't set headers). The `/ws`
//! RPC endpoint authenticates in-band via the `auth` method instead.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the token length from response
/// times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Pull the presented token out of a request: `Authorization: Bearer …` wins,
/// then the `token` query parameter.
fn presented_token(request: &Request) -> Option<String> {
    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());
    if let Some(h) = header {
        return Some(h.strip_prefix("Bearer ").unwrap_or(h).to_string());
    }
    request.uri().query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(ToString::to_string)
    })
}

/// Axum middleware rejecting requests that don't carry the expected token.
///
/// The expected token is injected via the [`AuthToken`] extension on the
/// router so the middleware doesn't need `AppState`.
pub async fn require_token(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<AuthToken>().map(|t| t.0.clone()) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error"})),
        )
            .into_response();
    };

    let Some(provided) = presented_token(&request) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing authentication token"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid authentication token"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Extension type carrying the expected auth token for [`require_token`].
#[derive(Clone)]
pub struct AuthToken(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal() {
        assert!(constant_time_eq(b"secret-token", b"secret-token"));
    }

    #[test]
    fn constant_time_eq_rejects_unequal() {
        assert!(!constant_time_eq(b"secret-token", b"secret-tokeX"));
        assert!(!constant_time_eq(b"secret-token", b"other"));
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"secret", b"secret-token"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }
}
