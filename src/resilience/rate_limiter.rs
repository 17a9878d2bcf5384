//! Fixed-window rate limiter keyed by `(caller, endpoint class)`.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Groups of endpoints that share a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Anything that enqueues generation work.
    Generation,
    /// Status polling and other reads.
    Status,
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointClass::Generation => write!(f, "generation"),
            EndpointClass::Status => write!(f, "status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub ceilings: HashMap<EndpointClass, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            ceilings: HashMap::from([
                (EndpointClass::Generation, 5),
                (EndpointClass::Status, 60),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded for {class}, retry after {retry_after_secs}s")]
pub struct RateLimited {
    pub class: EndpointClass,
    pub limit: u32,
    pub retry_after_secs: u64,
}

/// Accepted request, with what is left in the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<(String, EndpointClass), Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn limit_for(&self, class: EndpointClass) -> Option<u32> {
        self.config.ceilings.get(&class).copied()
    }

    /// Count one request. The entry guard holds the shard lock for the whole
    /// read-check-increment, so two concurrent requests cannot both slip past a
    /// ceiling that was just reached.
    pub fn check(&self, caller: &str, class: EndpointClass) -> Result<RateLimitStatus, RateLimited> {
        let Some(limit) = self.limit_for(class) else {
            return Ok(RateLimitStatus {
                limit: u32::MAX,
                remaining: u32::MAX,
            });
        };

        let now = Instant::now();
        let mut window = self
            .windows
            .entry((caller.to_string(), class))
            .or_insert_with(|| Window {
                started: now,
                count: 0,
            });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= limit {
            let remaining = self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(window.started));
            let retry_after_secs = remaining.as_millis().div_ceil(1000).max(1) as u64;
            debug!(caller, %class, limit, retry_after_secs, "rate limit rejected request");
            return Err(RateLimited {
                class,
                limit,
                retry_after_secs,
            });
        }

        window.count += 1;
        Ok(RateLimitStatus {
            limit,
            remaining: limit - window.count,
        })
    }

    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Drop windows that expired; keeps the map from growing with one-off callers.
    /// Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
        before.saturating_sub(self.windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn sixth_generation_call_is_rejected_within_the_window() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for i in 0..5 {
            let status = limiter.check("alice", EndpointClass::Generation).unwrap();
            assert_eq!(status.remaining, 4 - i);
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        let err = limiter
            .check("alice", EndpointClass::Generation)
            .unwrap_err();
        assert_eq!(err.limit, 5);
        assert!(err.retry_after_secs <= 60);
        assert_eq!(err.retry_after_secs, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn window_resets_on_expiry() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..5 {
            limiter.check("bob", EndpointClass::Generation).unwrap();
        }
        assert!(limiter.check("bob", EndpointClass::Generation).is_err());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("bob", EndpointClass::Generation).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn callers_and_classes_are_isolated() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        for _ in 0..5 {
            limiter.check("carol", EndpointClass::Generation).unwrap();
        }
        assert!(limiter.check("dave", EndpointClass::Generation).is_ok());
        assert!(limiter.check("carol", EndpointClass::Status).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_exceed_the_ceiling() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("eve", EndpointClass::Status).is_ok()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 50);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.check("eve", EndpointClass::Status).is_ok()
            }));
        }
        let mut accepted = 0;
        for h in handles {
            if h.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_stale_windows() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.check("frank", EndpointClass::Status).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        limiter.check("grace", EndpointClass::Status).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.windows.len(), 1);
    }
}
