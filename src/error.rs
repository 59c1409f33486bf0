//! Error Taxonomy
//!
//! Every failure the pipeline can produce is a `GateError` variant.
//! Validation, permission, and rate-limit failures short-circuit before a
//! subprocess is spawned; execution-time failures are caught at the executor
//! boundary. The gateway maps all of these into structured failure results,
//! so callers never observe an unhandled fault from the pipeline.

use std::time::Duration;

/// Failures produced by the mediated execution pipeline
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("Tool '{0}' not found")]
    ToolNotFound(String),

    #[error("Missing required argument: {0}")]
    MissingRequiredArgument(String),

    #[error("Invalid value for argument '{argument}': {reason}")]
    InvalidArgumentValue { argument: String, reason: String },

    #[error("Dangerous input rejected in argument '{argument}': {reason}")]
    DangerousInput { argument: String, reason: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Rate limit exceeded for '{identity}', retry after {retry_after_secs}s")]
    RateLimited {
        identity: String,
        retry_after_secs: u64,
    },

    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    #[error("Output validation failed: {0}")]
    OutputValidation(String),

    #[error("{resource} '{id}' not found")]
    UnknownId { resource: &'static str, id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl GateError {
    /// True for failures detected before any subprocess is spawned.
    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            GateError::ToolNotFound(_)
                | GateError::MissingRequiredArgument(_)
                | GateError::InvalidArgumentValue { .. }
                | GateError::DangerousInput { .. }
                | GateError::PermissionDenied(_)
                | GateError::RateLimited { .. }
        )
    }

    /// Short machine-friendly tag used in audit metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::ToolNotFound(_) => "tool_not_found",
            GateError::MissingRequiredArgument(_) => "missing_required_argument",
            GateError::InvalidArgumentValue { .. } => "invalid_argument_value",
            GateError::DangerousInput { .. } => "dangerous_input",
            GateError::PermissionDenied(_) => "permission_denied",
            GateError::RateLimited { .. } => "rate_limited",
            GateError::Timeout(_) => "execution_timeout",
            GateError::ExecutionFailure(_) => "execution_failure",
            GateError::OutputValidation(_) => "output_validation",
            GateError::UnknownId { .. } => "unknown_id",
            GateError::Persistence(_) => "persistence",
        }
    }
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        GateError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_failures() {
        assert!(GateError::ToolNotFound("x".into()).is_admission_failure());
        assert!(GateError::PermissionDenied("no".into()).is_admission_failure());
        assert!(GateError::RateLimited {
            identity: "u".into(),
            retry_after_secs: 5
        }
        .is_admission_failure());

        assert!(!GateError::Timeout(Duration::from_secs(1)).is_admission_failure());
        assert!(!GateError::ExecutionFailure("boom".into()).is_admission_failure());
    }

    #[test]
    fn test_error_messages_are_descriptive() {
        let err = GateError::MissingRequiredArgument("target".into());
        assert!(err.to_string().contains("Missing required argument"));
        assert!(err.to_string().contains("target"));

        let err = GateError::InvalidArgumentValue {
            argument: "ports".into(),
            reason: "not a valid port range".into(),
        };
        assert!(err.to_string().contains("ports"));
        assert!(err.to_string().contains("port range"));
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(GateError::ToolNotFound("x".into()).kind(), "tool_not_found");
        assert_eq!(
            GateError::Timeout(Duration::from_secs(5)).kind(),
            "execution_timeout"
        );
    }

    #[test]
    fn test_unknown_id_is_not_a_persistence_fault() {
        let err = GateError::UnknownId {
            resource: "History entry",
            id: "abc".into(),
        };
        assert_eq!(err.to_string(), "History entry 'abc' not found");
        assert_eq!(err.kind(), "unknown_id");
        assert!(!err.is_admission_failure());
    }
}
