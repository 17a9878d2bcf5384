//! One resilient model call: circuit breaker, per-call timeout, retry with backoff,
//! and typed parsing of the reply. Every LLM-backed stage goes through [`LlmInvoker`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::StageError;
use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest, ModelTier};
use crate::resilience::{
    CircuitOpenError, ResilienceRegistry, RetryClass, RetryError, RetryOptions, Retryable,
    with_retry,
};

/// Breaker key for the model provider.
pub const LLM_BREAKER_KEY: &str = "anthropic";

#[derive(Debug, Error)]
enum CallError {
    #[error(transparent)]
    Dependency(AnthropicError),
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    #[error("malformed output: {0}")]
    Malformed(String),
}

impl Retryable for CallError {
    fn retry_class(&self) -> RetryClass {
        match self {
            CallError::Dependency(e) if e.is_retryable() => RetryClass::Transient,
            CallError::Dependency(_) | CallError::CircuitOpen(_) => RetryClass::Fatal,
            CallError::Malformed(_) => RetryClass::Malformed,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Dependency(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Model endpoint bound to a tier, token budget, timeout and retry policy.
#[derive(Clone)]
pub struct LlmInvoker {
    sender: Arc<dyn MessageSender>,
    registry: Arc<ResilienceRegistry>,
    tier: ModelTier,
    max_tokens: u32,
    call_timeout: Duration,
    retry: RetryOptions,
}

impl LlmInvoker {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        registry: Arc<ResilienceRegistry>,
        tier: ModelTier,
        retry: RetryOptions,
    ) -> Self {
        Self {
            sender,
            registry,
            tier,
            max_tokens: 4096,
            call_timeout: Duration::from_secs(120),
            retry,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Send `prompt`, then run `parse` over the reply text. Parse failures are
    /// retried as malformed output under their own cap.
    pub async fn complete_parsed<T>(
        &self,
        system: &str,
        prompt: &str,
        cancel: &CancellationToken,
        parse: impl Fn(&str) -> Result<T, String>,
    ) -> Result<T, StageError> {
        let breaker = self.registry.breaker(LLM_BREAKER_KEY);
        let breaker = &breaker;
        let parse = &parse;
        let this = self;

        let outcome = with_retry(
            move |attempt| {
                let breaker = Arc::clone(breaker);
                async move {
                    debug!(attempt, model = %this.tier.api_model(), "invoking model");
                    let req = MessagesRequest::user_prompt(this.tier, this.max_tokens, prompt)
                        .with_system(system)
                        .with_temperature(0.2);
                    let call = async {
                        match timeout(this.call_timeout, this.sender.send_message(&req)).await {
                            Ok(result) => result,
                            Err(_) => Err(AnthropicError::Timeout(this.call_timeout)),
                        }
                    };
                    let response = breaker
                        .call(call, |e: &AnthropicError| e.is_retryable())
                        .await
                        .map_err(CallError::CircuitOpen)?
                        .map_err(CallError::Dependency)?;
                    let text = response
                        .text()
                        .ok_or_else(|| CallError::Malformed("empty model response".into()))?;
                    parse(&text).map_err(CallError::Malformed)
                }
            },
            &self.retry,
            cancel,
        )
        .await;

        let attempts = outcome.attempts;
        let total_delay_ms = outcome.total_delay_ms();
        match outcome.result {
            Ok(value) => Ok(value),
            Err(RetryError::Cancelled) => Err(StageError::Cancelled),
            Err(RetryError::Operation(CallError::CircuitOpen(e))) => {
                warn!(key = %e.key, retry_in_ms = e.retry_in.as_millis() as u64, "model call rejected by open circuit");
                Err(StageError::CircuitOpen(e))
            }
            Err(RetryError::Operation(CallError::Malformed(reason))) => {
                Err(StageError::MalformedOutput(reason))
            }
            Err(RetryError::Operation(CallError::Dependency(e))) if !e.is_retryable() => {
                warn!(error = %e, "model call rejected");
                Err(StageError::DependencyRejected(e.to_string()))
            }
            Err(RetryError::Operation(CallError::Dependency(e))) => {
                Err(StageError::DependencyExhausted {
                    attempts,
                    total_delay_ms,
                    message: e.to_string(),
                })
            }
        }
    }
}
