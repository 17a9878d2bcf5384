use thiserror::Error;

use crate::error::ErrorClass;
use crate::resilience::CircuitOpenError;

/// Failure of one pipeline stage for one module. Caught at the orchestrator boundary
/// and turned into that module's result; never aborts sibling modules.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("InsufficientContent")]
    InsufficientContent,

    #[error("GenerationEmpty: produced {produced} cards, need at least {required}")]
    GenerationEmpty { produced: usize, required: usize },

    #[error("MalformedOutput: {0}")]
    MalformedOutput(String),

    #[error("CircuitOpen: {0}")]
    CircuitOpen(#[from] CircuitOpenError),

    #[error("DependencyUnavailable: {message} (after {attempts} attempts, {total_delay_ms}ms backoff)")]
    DependencyExhausted {
        attempts: u32,
        total_delay_ms: u64,
        message: String,
    },

    /// The dependency refused the request (bad key, invalid request); retrying cannot help.
    #[error("DependencyRejected: {0}")]
    DependencyRejected(String),

    #[error("ContentFetch: {0}")]
    ContentFetch(String),

    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    /// Stable short code recorded in module results.
    pub fn code(&self) -> &'static str {
        match self {
            StageError::InsufficientContent => "InsufficientContent",
            StageError::GenerationEmpty { .. } => "GenerationEmpty",
            StageError::MalformedOutput(_) => "MalformedOutput",
            StageError::CircuitOpen(_) => "CircuitOpen",
            StageError::DependencyExhausted { .. } => "DependencyUnavailable",
            StageError::DependencyRejected(_) => "DependencyRejected",
            StageError::ContentFetch(_) => "ContentFetch",
            StageError::Cancelled => "Cancelled",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StageError::InsufficientContent
            | StageError::GenerationEmpty { .. }
            | StageError::MalformedOutput(_) => ErrorClass::Content,
            StageError::CircuitOpen(_) | StageError::DependencyRejected(_) => {
                ErrorClass::PersistentDependency
            }
            StageError::DependencyExhausted { .. } | StageError::ContentFetch(_) => {
                ErrorClass::TransientDependency
            }
            StageError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn insufficient_content_code_matches_display() {
        let err = StageError::InsufficientContent;
        assert_eq!(err.code(), "InsufficientContent");
        assert_eq!(err.to_string(), "InsufficientContent");
        assert_eq!(err.class(), ErrorClass::Content);
    }

    #[test]
    fn circuit_open_is_persistent() {
        let err = StageError::from(CircuitOpenError {
            key: "anthropic".into(),
            retry_in: Duration::from_secs(12),
        });
        assert_eq!(err.class(), ErrorClass::PersistentDependency);
        assert!(err.to_string().contains("retry in 12000ms"));
    }
}
