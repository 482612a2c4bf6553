//! SDK Error Types
//!
//! Defines error types for the AATIS SDK.

use thiserror::Error;

use aatis_core::types::TaskState;

use crate::constitution::ConstitutionError;

/// SDK Result type alias
pub type SDKResult<T> = Result<T, SDKError>;

/// SDK errors
#[derive(Debug, Error)]
pub enum SDKError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigValidationError),

    /// Core error (index, persistence, audit)
    #[error(transparent)]
    Core(#[from] aatis_core::Error),

    /// Rule set could not be loaded
    #[error("constitution error: {0}")]
    Constitution(#[from] ConstitutionError),

    /// Memory operation error
    #[error("memory error: {message}")]
    Memory { message: String },

    /// Entry not found
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// Transition not allowed from the task's current state
    #[error("illegal transition for task {task_id}: {from} -> {to} ({message})")]
    IllegalTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
        message: String,
    },

    /// No healthy capability accepts the required tags
    #[error("no capability accepts tags [{tags}]")]
    NoCapability { tags: String },

    /// The constitution denied the action
    #[error("policy denied: {}", .rules.join(", "))]
    PolicyDenied { rules: Vec<String> },

    /// The constitution escalated an action that has no review path
    #[error("policy escalation required: {}", .rules.join(", "))]
    PolicyEscalated { rules: Vec<String> },

    /// Capability reported a failure
    #[error("capability {capability} failed: {message}")]
    Capability { capability: String, message: String },

    /// Invalid operation
    #[error("invalid operation: {message}")]
    InvalidOperation { message: String },

    /// Timeout error
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Task was cancelled
    #[error("task cancelled: {task_id}")]
    Cancelled { task_id: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Config file parse error
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl SDKError {
    /// Create a memory error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an illegal transition error
    pub fn illegal_transition(
        task_id: impl Into<String>,
        from: TaskState,
        to: TaskState,
        message: impl Into<String>,
    ) -> Self {
        Self::IllegalTransition {
            task_id: task_id.into(),
            from,
            to,
            message: message.into(),
        }
    }

    /// Create an invalid operation error
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a capability error
    pub fn capability(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Capability {
            capability: capability.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
            || matches!(
                self,
                Self::Core(aatis_core::Error::TaskNotFound(_) | aatis_core::Error::MemoryNotFound(_))
            )
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is a rejected task transition
    pub fn is_illegal_transition(&self) -> bool {
        matches!(self, Self::IllegalTransition { .. })
    }

    /// Check if the constitution refused the action
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::PolicyDenied { .. } | Self::PolicyEscalated { .. })
    }

    /// Check if this error is an index input error the caller can correct and retry
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_index_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = SDKError::memory("test error");
        assert!(err.to_string().contains("test error"));

        let err = SDKError::not_found("Task", "123");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("Task"));
        assert!(err.to_string().contains("123"));

        let err = SDKError::timeout(5000);
        assert!(err.is_timeout());
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = SDKError::illegal_transition("t-1", TaskState::Received, TaskState::Completed, "not allowed");
        assert!(err.is_illegal_transition());
        assert_eq!(
            err.to_string(),
            "illegal transition for task t-1: received -> completed (not allowed)"
        );
    }

    #[test]
    fn test_core_errors_classified() {
        let err: SDKError = aatis_core::Error::dimension_mismatch(384, 2).into();
        assert!(err.is_dimension_mismatch());

        let err: SDKError = aatis_core::Error::TaskNotFound("t-9".into()).into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_policy_errors() {
        let err = SDKError::PolicyDenied {
            rules: vec!["destructive_command".into(), "possible_exfil".into()],
        };
        assert!(err.is_policy());
        assert_eq!(err.to_string(), "policy denied: destructive_command, possible_exfil");
    }
}
