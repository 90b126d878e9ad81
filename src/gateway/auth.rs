//! Bearer-token authentication middleware.
//!
//! Token sources, in order: `Authorization: Bearer`, `X-API-Key`, and the
//! `api_key` query parameter (for SSE clients that cannot set headers).
//! Comparison is constant-time over SHA-256 digests so neither length nor
//! prefix leaks.

use super::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Paths that never require a token.
const OPEN_PATHS: &[&str] = &["/healthz", "/version"];

pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.api_token.as_deref() else {
        // No token configured: the gateway runs open (dev mode).
        return next.run(request).await;
    };
    if OPEN_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    match extract_token(&request) {
        Some(token) if token_matches(expected, &token) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response(),
    }
}

/// Pull the presented token out of a request, first match wins.
pub fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = request.headers().get("x-api-key") {
        if let Ok(value) = value.to_str() {
            return Some(value.to_string());
        }
    }
    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("api_key=").map(ToString::to_string)
        })
    })
}

/// Constant-time token comparison.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    let a = Sha256::digest(expected.as_bytes());
    let b = Sha256::digest(presented.as_bytes());
    a.ct_eq(&b).into()
}
