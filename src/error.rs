use thiserror::Error;

use crate::anthropic::AnthropicError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum CardforgeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid job request: {0}")]
    InvalidRequest(String),

    #[error("Job {job_id} is already {status}")]
    JobTerminal { job_id: String, status: String },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse classification of a failure, used for logging and for deciding whether a
/// failure stays inside one module or takes the whole job down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limits, 5xx, network blips. Absorbed by retry until it exhausts.
    TransientDependency,
    /// Circuit open, or the dependency rejected the request outright.
    PersistentDependency,
    /// Bad or missing content. Fails only the affected module.
    Content,
    /// Cooperative cancellation fired.
    Cancelled,
    /// Persistence or other orchestrator-level failure. Fails the job.
    Orchestrator,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::TransientDependency => write!(f, "TransientDependency"),
            ErrorClass::PersistentDependency => write!(f, "PersistentDependency"),
            ErrorClass::Content => write!(f, "Content"),
            ErrorClass::Cancelled => write!(f, "Cancelled"),
            ErrorClass::Orchestrator => write!(f, "Orchestrator"),
        }
    }
}

/// Cuts an error message down to `max` characters, appending an ellipsis when cut.
pub fn truncate_message(message: &str, max: usize) -> String {
    if message.chars().count() <= max {
        return message.to_string();
    }
    let mut out: String = message.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_display() {
        assert_eq!(ErrorClass::Content.to_string(), "Content");
        assert_eq!(
            ErrorClass::PersistentDependency.to_string(),
            "PersistentDependency"
        );
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_message("short", 10), "short");
    }

    #[test]
    fn truncate_cuts_long_messages() {
        let long = "x".repeat(600);
        let cut = truncate_message(&long, 500);
        assert_eq!(cut.chars().count(), 500);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn job_terminal_display() {
        let err = CardforgeError::JobTerminal {
            job_id: "j1".into(),
            status: "completed".into(),
        };
        assert_eq!(err.to_string(), "Job j1 is already completed");
    }
}
