//! # Resilience core
//!
//! Shared by every stage that calls out to the model or the content fetcher:
//!
//! - [`retry`]: retry with exponential backoff, jitter and cooperative cancellation
//! - [`circuit_breaker`]: per-dependency breaker with a single half-open probe
//! - [`rate_limiter`]: fixed-window limiter keyed by caller and endpoint class
//! - [`ResilienceRegistry`]: injectable owner of breaker and limiter state
//!
//! Failures here never crash a caller. They surface as a module-level failed result
//! or, for orchestrator-level problems, a failed job.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitOpenError,
    CircuitState,
};
pub use rate_limiter::{EndpointClass, RateLimitConfig, RateLimitStatus, RateLimited, RateLimiter};
pub use registry::ResilienceRegistry;
pub use retry::{
    RetryClass, RetryError, RetryExhausted, RetryOptions, RetryOutcome, Retryable, with_retry,
    with_retry_throw,
};
