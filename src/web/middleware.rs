//! Request middleware: bearer auth, per-caller rate limiting, and redaction of
//! internal error detail in production.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::AppState;
use super::error::{ApiError, GENERIC_INTERNAL_MESSAGE, error_body};
use crate::resilience::EndpointClass;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Who is calling, for rate-limit accounting. A bearer token always wins, keyed by its
/// fingerprint so the secret never reaches logs; `x-caller-id` only distinguishes
/// callers that present no token.
pub fn caller_identity(headers: &HeaderMap) -> String {
    if let Some(token) = bearer_token(headers) {
        return format!("token:{}", token_fingerprint(token));
    }
    headers
        .get(CALLER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// Rejects requests without the configured bearer token. A server with no token
/// configured accepts everything.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.orchestrator.config().server.api_token.as_deref() else {
        return Ok(next.run(request).await);
    };
    match bearer_token(request.headers()) {
        Some(token) if token == expected => Ok(next.run(request).await),
        Some(_) => {
            warn!(path = %request.uri().path(), "rejected request with invalid token");
            Err(ApiError::Unauthorized)
        }
        None => {
            debug!(path = %request.uri().path(), "rejected request without token");
            Err(ApiError::Unauthorized)
        }
    }
}

async fn enforce_rate(
    state: &AppState,
    class: EndpointClass,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let caller = caller_identity(request.headers());
    let status = state
        .orchestrator
        .registry()
        .check_rate(&caller, class)
        .inspect_err(|e| warn!(caller, %class, retry_after_secs = e.retry_after_secs, "rate limited"))?;

    let mut response = next.run(request).await;
    if status.remaining != u32::MAX {
        response.headers_mut().insert(
            RATE_LIMIT_REMAINING_HEADER,
            HeaderValue::from(status.remaining),
        );
    }
    Ok(response)
}

pub async fn generation_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    enforce_rate(&state, EndpointClass::Generation, request, next).await
}

pub async fn status_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    enforce_rate(&state, EndpointClass::Status, request, next).await
}

/// In production, 500 responses carry a generic message; the detail is only logged.
pub async fn redact_internal_errors(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if state.orchestrator.config().is_production()
        && response.status() == StatusCode::INTERNAL_SERVER_ERROR
    {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_body("INTERNAL_ERROR", GENERIC_INTERNAL_MESSAGE)),
        )
            .into_response();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn bearer_token_outranks_caller_header() {
        let with_token = caller_identity(&headers(&[
            ("x-caller-id", "svc-a"),
            ("authorization", "Bearer tok"),
        ]));
        let rotated = caller_identity(&headers(&[
            ("x-caller-id", "svc-b"),
            ("authorization", "Bearer tok"),
        ]));
        assert_eq!(with_token, rotated);
        assert!(with_token.starts_with("token:"));
        assert_eq!(caller_identity(&headers(&[("authorization", "Bearer tok")])), with_token);
        assert_ne!(caller_identity(&headers(&[("authorization", "Bearer other")])), with_token);
    }

    #[test]
    fn caller_header_applies_without_token() {
        assert_eq!(caller_identity(&headers(&[("x-caller-id", "svc-a")])), "svc-a");
        assert_eq!(caller_identity(&headers(&[("x-caller-id", "  ")])), "anonymous");
        assert_eq!(caller_identity(&HeaderMap::new()), "anonymous");
    }

    #[test]
    fn bearer_requires_scheme() {
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
    }
}
