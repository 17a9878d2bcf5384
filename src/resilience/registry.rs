use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use super::rate_limiter::{EndpointClass, RateLimitConfig, RateLimitStatus, RateLimited, RateLimiter};

/// Process-wide resilience state: one circuit breaker per logical dependency plus the
/// rate-limit counters. Injected wherever it is needed so tests get isolated state.
#[derive(Debug)]
pub struct ResilienceRegistry {
    breaker_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limiter: RateLimiter,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), RateLimitConfig::default())
    }
}

impl ResilienceRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig, rate_limits: RateLimitConfig) -> Self {
        Self {
            breaker_config,
            breakers: DashMap::new(),
            limiter: RateLimiter::new(rate_limits),
        }
    }

    /// Breaker for `key`, created on first use. Callers get an `Arc` so no map lock
    /// is held across an await.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.breaker_config.clone())))
            .value()
            .clone()
    }

    pub fn check_rate(&self, caller: &str, class: EndpointClass) -> Result<RateLimitStatus, RateLimited> {
        self.limiter.check(caller, class)
    }

    /// Drop expired rate windows once per window length until `shutdown` fires.
    pub fn spawn_window_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let period = registry.limiter.window().max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => {
                        let purged = registry.limiter.purge_expired();
                        if purged > 0 {
                            debug!(purged, "dropped expired rate-limit windows");
                        }
                    }
                }
            }
        })
    }

    /// Snapshot of every breaker, sorted by key.
    pub fn breaker_snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<CircuitBreakerState> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    #[test]
    fn same_key_returns_same_breaker() {
        let registry = ResilienceRegistry::default();
        let a = registry.breaker("anthropic:generator");
        let b = registry.breaker("anthropic:generator");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn registries_do_not_share_state() {
        let one = ResilienceRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            RateLimitConfig::default(),
        );
        let two = ResilienceRegistry::default();
        one.breaker("llm").record_failure();
        assert_eq!(one.breaker("llm").state(), CircuitState::Open);
        assert_eq!(two.breaker("llm").state(), CircuitState::Closed);
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = ResilienceRegistry::default();
        registry.breaker("b");
        registry.breaker("a");
        let keys: Vec<String> = registry
            .breaker_snapshot()
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_drops_expired_windows_until_shutdown() {
        let swept = Arc::new(ResilienceRegistry::default());
        let unswept = ResilienceRegistry::default();
        swept.check_rate("one-off", EndpointClass::Generation).unwrap();
        unswept.check_rate("one-off", EndpointClass::Generation).unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = swept.spawn_window_sweeper(shutdown.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(swept.limiter.purge_expired(), 0);
        assert_eq!(unswept.limiter.purge_expired(), 1);

        shutdown.cancel();
        sweeper.await.unwrap();
    }
}
