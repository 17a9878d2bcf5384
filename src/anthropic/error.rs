//! Error types for the Anthropic Messages client.
//!
//! [`AnthropicError`] also carries the transient/permanent classification the
//! resilience layer needs: which failures are worth retrying and whether the
//! provider told us how long to wait.

use std::time::Duration;

use thiserror::Error;

/// HTTP statuses treated as transient.
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];

/// Message fragments that identify a transient network or rate-limit failure when
/// no status code is available.
const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "too many requests",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "econnreset",
    "etimedout",
    "socket hang up",
    "temporarily unavailable",
    "overloaded",
];

/// Errors that can occur while talking to the Anthropic API.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// The server returned HTTP 429. `retry_after_ms` comes from the `retry-after`
    /// header when present.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status (401 bad key, 500 internal error, ...).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The call did not finish within the per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The response carried no text content block.
    #[error("response contained no text content")]
    EmptyResponse,

    /// Underlying network failure (DNS, refused connection, reqwest timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnthropicError::RateLimited { .. } | AnthropicError::Timeout(_) => true,
            AnthropicError::ApiError { status, message } => {
                RETRYABLE_STATUSES.contains(status) || is_transient_message(message)
            }
            AnthropicError::NetworkError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e
                        .status()
                        .is_some_and(|s| RETRYABLE_STATUSES.contains(&s.as_u16()))
                    || is_transient_message(&e.to_string())
            }
            AnthropicError::EmptyResponse => false,
        }
    }

    /// Provider-supplied wait, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnthropicError::RateLimited { retry_after_ms } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }
}

/// Recognizes transient failures from free-form error text.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}
