//! Error types for the agent daemon.

use thiserror::Error;
use vpc_models::ModelError;
use vpc_ovnutil::OvnError;

use crate::compiler::CompileError;

/// Result type alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur in the sync and reconcile loops.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A list request against the orchestration API failed.
    #[error("API request failed: {operation}: {message}")]
    Api {
        /// The operation that failed (e.g. "list vpcs").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Northbound database access failed.
    #[error(transparent)]
    Ovn(#[from] OvnError),

    /// A fetched record could not be decoded.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// A security group rule or listener policy did not compile.
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The reconcile pass panicked.
    #[error("Reconcile pass panicked: {message}")]
    Panicked {
        /// Panic payload, if it was a string.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl AgentError {
    /// Creates an API error.
    pub fn api(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Api { .. } => true,
            AgentError::Ovn(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::api("list vpcs", "HTTP 502");
        assert_eq!(err.to_string(), "API request failed: list vpcs: HTTP 502");
    }

    #[test]
    fn test_is_retryable() {
        assert!(AgentError::api("list hosts", "timeout").is_retryable());
        let timeout = AgentError::from(OvnError::Timeout {
            command: "ovn-nbctl".to_string(),
            timeout_secs: 8,
        });
        assert!(timeout.is_retryable());
        assert!(!AgentError::invalid_config("api.base_url", "empty").is_retryable());
        assert!(!AgentError::Panicked {
            message: "boom".to_string()
        }
        .is_retryable());
    }
}
