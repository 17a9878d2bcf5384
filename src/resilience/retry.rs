//! Retry with exponential backoff.
//!
//! Only failures classified as retryable are retried. Transient dependency failures
//! and malformed model output are counted against separate caps so a model that keeps
//! returning garbage cannot burn the whole network-retry budget (and vice versa).

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a failed attempt should be treated by [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Rate limit, 5xx, timeout or network blip.
    Transient,
    /// The dependency answered but the output failed schema validation.
    Malformed,
    /// Not worth retrying.
    Fatal,
}

/// Implemented by error types that flow through [`with_retry`].
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;

    /// Provider-supplied wait that overrides the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Backoff and cap settings for one call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    /// Retries allowed for transient failures. Total attempts never exceed this + 1
    /// when every failure is transient.
    pub max_retries: u32,
    /// Retries allowed for malformed output, counted independently.
    pub max_malformed_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Spread each delay by ±25%.
    pub jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_malformed_retries: 2,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Un-jittered delay before retry number `attempt` (0-based):
    /// `initial_delay * multiplier^attempt`, clamped to `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = base * self.multiplier.powi(exp);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay actually slept: the provider hint if present, otherwise the backoff,
    /// optionally jittered. Always clamped to `max_delay`.
    fn effective_delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let delay = match hint {
            Some(hint) => hint,
            None if self.jitter => {
                let base = self.delay_for_attempt(attempt).as_millis() as f64;
                let factor = rand::thread_rng().gen_range(0.75..=1.25);
                Duration::from_millis((base * factor) as u64)
            }
            None => self.delay_for_attempt(attempt),
        };
        delay.min(self.max_delay)
    }
}

/// Why a retried operation ended without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt's error (fatal, or its class ran out of retries).
    Operation(E),
    /// The cancellation token fired before an attempt or during a sleep.
    Cancelled,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Operation(e) => write!(f, "{e}"),
            RetryError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

/// Result of [`with_retry`] together with attempt accounting.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, RetryError<E>>,
    pub attempts: u32,
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn total_delay_ms(&self) -> u64 {
        self.total_delay.as_millis() as u64
    }

    /// Collapse into a `Result`, attaching attempt metadata to the error.
    pub fn into_result(self) -> Result<T, RetryExhausted<E>> {
        match self.result {
            Ok(v) => Ok(v),
            Err(source) => Err(RetryExhausted {
                source,
                attempts: self.attempts,
                total_delay_ms: self.total_delay.as_millis() as u64,
            }),
        }
    }
}

/// Error returned by [`with_retry_throw`].
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub source: RetryError<E>,
    pub attempts: u32,
    pub total_delay_ms: u64,
}

impl<E: fmt::Display> fmt::Display for RetryExhausted<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (after {} attempts, {}ms backoff)",
            self.source, self.attempts, self.total_delay_ms
        )
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryExhausted<E> {}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of retries
/// for its failure class, or `cancel` fires. `op` receives the 1-based attempt number.
pub async fn with_retry<T, E, F, Fut>(
    mut op: F,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let mut attempts = 0u32;
    let mut transient_retries = 0u32;
    let mut malformed_retries = 0u32;
    let mut total_delay = Duration::ZERO;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(RetryError::Cancelled),
                attempts,
                total_delay,
            };
        }

        attempts += 1;
        let err = match op(attempts).await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(attempts, "operation succeeded after retry");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                    total_delay,
                };
            }
            Err(err) => err,
        };

        let retry_index = match err.retry_class() {
            RetryClass::Transient if transient_retries < options.max_retries => {
                transient_retries += 1;
                transient_retries - 1
            }
            RetryClass::Malformed if malformed_retries < options.max_malformed_retries => {
                malformed_retries += 1;
                malformed_retries - 1
            }
            _ => {
                return RetryOutcome {
                    result: Err(RetryError::Operation(err)),
                    attempts,
                    total_delay,
                };
            }
        };

        let delay = options.effective_delay(retry_index, err.retry_after());
        warn!(
            attempt = attempts,
            class = ?err.retry_class(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after failure"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(RetryError::Cancelled),
                    attempts,
                    total_delay,
                };
            }
            _ = sleep(delay) => {}
        }
        total_delay += delay;
    }
}

/// Same contract as [`with_retry`], returning an error that carries attempt metadata.
pub async fn with_retry_throw<T, E, F, Fut>(
    op: F,
    options: &RetryOptions,
    cancel: &CancellationToken,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    with_retry(op, options, cancel).await.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        class: RetryClass,
        hint: Option<Duration>,
    }

    impl TestError {
        fn transient() -> Self {
            Self {
                class: RetryClass::Transient,
                hint: None,
            }
        }
        fn of(class: RetryClass) -> Self {
            Self { class, hint: None }
        }
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self.class)
        }
    }

    impl Retryable for TestError {
        fn retry_class(&self) -> RetryClass {
            self.class
        }
        fn retry_after(&self) -> Option<Duration> {
            self.hint
        }
    }

    fn fast_options(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            max_malformed_retries: 1,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_and_clamps() {
        let opts = fast_options(5);
        assert_eq!(opts.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(opts.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(opts.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(opts.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(opts.delay_for_attempt(60), Duration::from_millis(400));
    }

    #[test]
    fn jittered_delay_never_exceeds_max() {
        let opts = RetryOptions {
            jitter: true,
            ..fast_options(5)
        };
        for attempt in 0..20 {
            assert!(opts.effective_delay(attempt, None) <= opts.max_delay);
        }
        assert_eq!(
            opts.effective_delay(0, Some(Duration::from_secs(90))),
            opts.max_delay
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_stop_at_max_retries_plus_one() {
        for max_retries in 0..5 {
            let calls = Arc::new(AtomicU32::new(0));
            let c = calls.clone();
            let outcome: RetryOutcome<(), TestError> = with_retry(
                move |_| {
                    let c = c.clone();
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(TestError::transient())
                    }
                },
                &fast_options(max_retries),
                &CancellationToken::new(),
            )
            .await;

            assert!(!outcome.success());
            assert_eq!(outcome.attempts, max_retries + 1);
            assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let outcome = with_retry(
            |attempt| async move {
                if attempt < 3 {
                    Err(TestError::transient())
                } else {
                    Ok(attempt)
                }
            },
            &fast_options(5),
            &CancellationToken::new(),
        )
        .await;

        assert!(outcome.success());
        assert_eq!(outcome.attempts, 3);
        // 100ms + 200ms
        assert_eq!(outcome.total_delay_ms(), 300);
        assert_eq!(outcome.result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let outcome: RetryOutcome<(), TestError> = with_retry(
            |_| async { Err(TestError::of(RetryClass::Fatal)) },
            &fast_options(5),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.total_delay, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_output_has_its_own_cap() {
        let outcome: RetryOutcome<(), TestError> = with_retry(
            |_| async { Err(TestError::of(RetryClass::Malformed)) },
            &fast_options(5),
            &CancellationToken::new(),
        )
        .await;
        // max_malformed_retries = 1
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_backoff() {
        let outcome = with_retry(
            |attempt| async move {
                if attempt == 1 {
                    Err(TestError {
                        class: RetryClass::Transient,
                        hint: Some(Duration::from_millis(250)),
                    })
                } else {
                    Ok(())
                }
            },
            &fast_options(3),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.total_delay, Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_first_attempt_makes_no_calls() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let outcome: RetryOutcome<(), TestError> = with_retry(
            move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            &fast_options(3),
            &token,
        )
        .await;
        assert!(matches!(outcome.result, Err(RetryError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_sleep_stops_retrying() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let outcome: RetryOutcome<(), TestError> = with_retry(
            move |_| {
                let canceller = canceller.clone();
                async move {
                    canceller.cancel();
                    Err(TestError::transient())
                }
            },
            &fast_options(5),
            &token,
        )
        .await;
        assert!(matches!(outcome.result, Err(RetryError::Cancelled)));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throw_variant_attaches_metadata() {
        let err = with_retry_throw::<(), _, _, _>(
            |_| async { Err(TestError::transient()) },
            &fast_options(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.total_delay_ms, 300);
        assert!(err.to_string().contains("after 3 attempts"));
    }
}
