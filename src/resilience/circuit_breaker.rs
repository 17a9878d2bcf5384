//! # Circuit Breaker
//!
//! Per-dependency fault isolation. Retry tolerates one call's blip; the breaker stops
//! hammering a dependency that is already down.
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected immediately with the remaining cool-down.
//! - **Half-open**: after the reset window exactly one probe is admitted. Success
//!   closes the circuit, failure re-opens it with a fresh cool-down.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time spent open before a probe is admitted.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Rejection returned while the circuit is open (or a probe is already in flight).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker open for {key}, retry in {}ms", retry_in.as_millis())]
pub struct CircuitOpenError {
    pub key: String,
    pub retry_in: Duration,
}

/// Point-in-time view of one breaker, for health and metrics output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub key: String,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub state: CircuitState,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let key = key.into();
        debug!(
            key = %key,
            failure_threshold = config.failure_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "circuit breaker created"
        );
        Self {
            key,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Decide whether a call may proceed. The check and the open → half-open
    /// transition happen under one lock, so two concurrent callers cannot both
    /// become the probe.
    pub fn try_acquire(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.config.reset_timeout);
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    info!(key = %self.key, "circuit half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(CircuitOpenError {
                        key: self.key.clone(),
                        retry_in: self.config.reset_timeout - elapsed,
                    })
                }
            }
            // The probe is in flight; everyone else waits for its verdict.
            CircuitState::HalfOpen => Err(CircuitOpenError {
                key: self.key.clone(),
                retry_in: Duration::ZERO,
            }),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(key = %self.key, "probe succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure = Some(Utc::now());
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(key = %self.key, "probe failed, circuit re-opened");
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    key = %self.key,
                    failures = inner.consecutive_failures,
                    "failure threshold reached, circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Wrap one async call. `is_failure` decides whether an error counts against the
    /// dependency (a well-formed 400 does not, a 503 does).
    pub async fn call<T, E, Fut>(
        &self,
        fut: Fut,
        is_failure: impl FnOnce(&E) -> bool,
    ) -> Result<Result<T, E>, CircuitOpenError>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.try_acquire()?;
        let result = fut.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if is_failure(e) => self.record_failure(),
            Err(_) => self.record_success(),
        }
        Ok(result)
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            key: self.key.clone(),
            failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
            state: inner.state,
        }
    }
}
