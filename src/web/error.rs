use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::error::CardforgeError;
use crate::resilience::RateLimited;
use crate::review::ReviewError;
use crate::store::StoreError;

pub(crate) const GENERIC_INTERNAL_MESSAGE: &str = "internal server error";

/// Every failure a handler can return. Rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unauthorized,
    RateLimited(RateLimited),
    ShuttingDown,
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::RateLimited(_) => "RATE_LIMITED",
            ApiError::ShuttingDown => "SHUTTING_DOWN",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::NotFound(m)
            | ApiError::BadRequest(m)
            | ApiError::Conflict(m)
            | ApiError::Internal(m) => m.clone(),
            ApiError::Unauthorized => "missing or invalid bearer token".to_string(),
            ApiError::RateLimited(e) => e.to_string(),
            ApiError::ShuttingDown => "service is shutting down".to_string(),
        }
    }
}

pub(crate) fn error_body(code: &str, message: &str) -> serde_json::Value {
    json!({ "error": { "code": code, "message": message } })
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.message();
        if status.is_server_error() {
            error!(code = self.code(), %message, "request failed");
        }
        let mut response = (status, Json(error_body(self.code(), &message))).into_response();
        if let ApiError::RateLimited(limited) = &self {
            if let Ok(value) = HeaderValue::from_str(&limited.retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::Unavailable(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<CardforgeError> for ApiError {
    fn from(e: CardforgeError) -> Self {
        match e {
            CardforgeError::JobNotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            CardforgeError::InvalidRequest(m) => ApiError::BadRequest(m),
            CardforgeError::JobTerminal { .. } => ApiError::Conflict(e.to_string()),
            CardforgeError::ShuttingDown => ApiError::ShuttingDown,
            CardforgeError::Store(store) => store.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ReviewError> for ApiError {
    fn from(e: ReviewError) -> Self {
        match e {
            ReviewError::NotFound(id) => ApiError::NotFound(format!("review item {id} not found")),
            ReviewError::Conflict(_) => ApiError::Conflict(e.to_string()),
            ReviewError::Invalid(m) => ApiError::BadRequest(m),
            ReviewError::Store(store) => store.into(),
        }
    }
}

impl From<RateLimited> for ApiError {
    fn from(e: RateLimited) -> Self {
        ApiError::RateLimited(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::EndpointClass;

    #[test]
    fn orchestrator_errors_map_to_statuses() {
        let cases = [
            (CardforgeError::JobNotFound("j".into()), StatusCode::NOT_FOUND),
            (CardforgeError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (
                CardforgeError::JobTerminal {
                    job_id: "j".into(),
                    status: "completed".into(),
                },
                StatusCode::CONFLICT,
            ),
            (CardforgeError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
            (
                CardforgeError::Store(StoreError::Conflict("dup".into())),
                StatusCode::CONFLICT,
            ),
            (CardforgeError::Config("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::from(RateLimited {
            class: EndpointClass::Generation,
            limit: 5,
            retry_after_secs: 42,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");
    }
}
