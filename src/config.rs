//! cardforge configuration, loaded from `cardforge.toml`.
//!
//! Every field has a default, so an absent or partial file is fine. Environment
//! variables take precedence over the file for secrets and deployment knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anthropic::ModelTier;
use crate::error::CardforgeError;
use crate::pipeline::VerificationMode;
use crate::resilience::{CircuitBreakerConfig, EndpointClass, RateLimitConfig, RetryOptions};

pub const DEFAULT_CONFIG_FILE: &str = "cardforge.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// What happens to module work already running when its job is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// In-flight modules finish and their results are recorded.
    Finish,
    /// In-flight modules finish but their results are discarded.
    #[default]
    Abandon,
}

/// Top-level configuration loaded from `cardforge.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardforgeConfig {
    /// Anthropic API key. Empty means offline mock mode.
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub environment: Environment,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub models: ModelConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    #[serde(default)]
    pub content: ContentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on every route but health. `None` disables auth.
    #[serde(default)]
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_sonnet")]
    pub summarizer: ModelTier,
    #[serde(default = "default_sonnet")]
    pub generator: ModelTier,
    #[serde(default = "default_haiku")]
    pub judge: ModelTier,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Per-call timeout for model requests.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            summarizer: default_sonnet(),
            generator: default_sonnet(),
            judge: default_haiku(),
            max_tokens: default_max_tokens(),
            llm_timeout_secs: default_llm_timeout_secs(),
            base_url: None,
        }
    }
}

impl ModelConfig {
    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,
    #[serde(default = "default_max_concurrent_modules")]
    pub max_concurrent_modules: usize,
    #[serde(default = "default_cards_per_module")]
    pub cards_per_module: usize,
    #[serde(default = "default_min_cards")]
    pub min_cards: usize,
    #[serde(default = "default_verification_mode")]
    pub verification_mode: VerificationMode,
    #[serde(default = "default_coverage_threshold")]
    pub coverage_threshold: f64,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    #[serde(default)]
    pub cancel_policy: CancelPolicy,
    /// Turn a job whose modules all failed into `failed` instead of `completed`.
    #[serde(default)]
    pub fail_when_no_module_succeeds: bool,
    /// Force offline mode even when an API key is present.
    #[serde(default)]
    pub use_mock: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: default_max_running_jobs(),
            max_concurrent_modules: default_max_concurrent_modules(),
            cards_per_module: default_cards_per_module(),
            min_cards: default_min_cards(),
            verification_mode: default_verification_mode(),
            coverage_threshold: default_coverage_threshold(),
            max_prompt_chars: default_max_prompt_chars(),
            cancel_policy: CancelPolicy::default(),
            fail_when_no_module_succeeds: false,
            use_mock: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_generation_retries")]
    pub generation_max_retries: u32,
    #[serde(default = "default_verification_retries")]
    pub verification_max_retries: u32,
    #[serde(default = "default_fetch_retries")]
    pub fetch_max_retries: u32,
    #[serde(default = "default_malformed_retries")]
    pub max_malformed_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            generation_max_retries: default_generation_retries(),
            verification_max_retries: default_verification_retries(),
            fetch_max_retries: default_fetch_retries(),
            max_malformed_retries: default_malformed_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    fn options(&self, max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            max_malformed_retries: self.max_malformed_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter: self.jitter,
        }
    }

    pub fn generation(&self) -> RetryOptions {
        self.options(self.generation_max_retries)
    }

    pub fn verification(&self) -> RetryOptions {
        self.options(self.verification_max_retries)
    }

    pub fn fetch(&self) -> RetryOptions {
        self.options(self.fetch_max_retries)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
        }
    }
}

impl From<&BreakerConfig> for CircuitBreakerConfig {
    fn from(c: &BreakerConfig) -> Self {
        CircuitBreakerConfig {
            failure_threshold: c.failure_threshold,
            reset_timeout: Duration::from_secs(c.reset_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_generation_limit")]
    pub generation_per_window: u32,
    #[serde(default = "default_status_limit")]
    pub status_per_window: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            generation_per_window: default_generation_limit(),
            status_per_window: default_status_limit(),
        }
    }
}

impl From<&RateLimitSection> for RateLimitConfig {
    fn from(s: &RateLimitSection) -> Self {
        let mut config = RateLimitConfig {
            window: Duration::from_secs(s.window_secs),
            ..RateLimitConfig::default()
        };
        config
            .ceilings
            .insert(EndpointClass::Generation, s.generation_per_window);
        config.ceilings.insert(EndpointClass::Status, s.status_per_window);
        config
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Directory holding `<course>/<module>.json` chunk files.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for CardforgeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            environment: Environment::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            server: ServerConfig::default(),
            models: ModelConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: BreakerConfig::default(),
            rate_limit: RateLimitSection::default(),
            content: ContentConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_sonnet() -> ModelTier {
    ModelTier::Sonnet
}

fn default_haiku() -> ModelTier {
    ModelTier::Haiku
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_max_running_jobs() -> usize {
    2
}

fn default_max_concurrent_modules() -> usize {
    3
}

fn default_cards_per_module() -> usize {
    10
}

fn default_min_cards() -> usize {
    1
}

fn default_verification_mode() -> VerificationMode {
    VerificationMode::Heuristic
}

fn default_coverage_threshold() -> f64 {
    0.5
}

fn default_max_prompt_chars() -> usize {
    24_000
}

fn default_generation_retries() -> u32 {
    5
}

fn default_verification_retries() -> u32 {
    3
}

fn default_fetch_retries() -> u32 {
    2
}

fn default_malformed_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_generation_limit() -> u32 {
    5
}

fn default_status_limit() -> u32 {
    60
}

impl CardforgeConfig {
    /// Load from `path`, or from `cardforge.toml` in the working directory. A missing
    /// file yields defaults; environment overrides are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self, CardforgeError> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = if path.exists() {
            Self::from_toml_str(&std::fs::read_to_string(path)?)?
        } else if explicit {
            return Err(CardforgeError::Config(format!(
                "config file {} does not exist",
                path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, CardforgeError> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("ANTHROPIC_API_KEY") {
            self.api_key = key;
        }
        if let Some(token) = get("CARDFORGE_API_TOKEN") {
            self.server.api_token = Some(token);
        }
        if let Some(env) = get("CARDFORGE_ENV") {
            match env.trim().to_lowercase().as_str() {
                "production" | "prod" => self.environment = Environment::Production,
                "development" | "dev" => self.environment = Environment::Development,
                other => tracing::warn!(value = other, "ignoring unknown CARDFORGE_ENV"),
            }
        }
        if let Some(limit) = get("CARDFORGE_RATE_LIMIT_GENERATION").and_then(|v| v.parse().ok()) {
            self.rate_limit.generation_per_window = limit;
        }
        if let Some(limit) = get("CARDFORGE_RATE_LIMIT_STATUS").and_then(|v| v.parse().ok()) {
            self.rate_limit.status_per_window = limit;
        }
        if let Some(bind) = get("CARDFORGE_BIND") {
            self.server.bind = bind;
        }
    }

    pub fn validate(&self) -> Result<(), CardforgeError> {
        let o = &self.orchestrator;
        if o.max_running_jobs == 0 {
            return Err(CardforgeError::Config("orchestrator.max_running_jobs must be at least 1".into()));
        }
        if o.max_concurrent_modules == 0 {
            return Err(CardforgeError::Config(
                "orchestrator.max_concurrent_modules must be at least 1".into(),
            ));
        }
        if o.cards_per_module == 0 {
            return Err(CardforgeError::Config("orchestrator.cards_per_module must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&o.coverage_threshold) {
            return Err(CardforgeError::Config(
                "orchestrator.coverage_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(CardforgeError::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(CardforgeError::Config(
                "circuit_breaker.failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// True when no model calls should be made.
    pub fn mock_mode(&self) -> bool {
        self.orchestrator.use_mock || self.api_key.trim().is_empty()
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}
