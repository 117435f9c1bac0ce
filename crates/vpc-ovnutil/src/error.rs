//! Error types for northbound database access.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use crate::value::ValueError;
use std::io;
use thiserror::Error;

/// Result type alias for northbound operations.
pub type OvnResult<T> = Result<T, OvnError>;

/// Errors that can occur while listing or transacting against the northbound DB.
#[derive(Debug, Error)]
pub enum OvnError {
    /// Failed to spawn `ovn-nbctl`.
    #[error("Failed to execute '{command}': {source}")]
    Exec {
        /// The command line that failed to spawn.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// `ovn-nbctl` returned a non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The command line.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// `ovn-nbctl` did not finish in time.
    #[error("Command timed out after {timeout_secs}s: '{command}'")]
    Timeout {
        /// The command line.
        command: String,
        /// The configured timeout.
        timeout_secs: u64,
    },

    /// A column value did not decode.
    #[error("Failed to decode {table}.{column}: {source}")]
    Decode {
        /// The table being decoded.
        table: String,
        /// The offending column.
        column: String,
        /// The underlying value error.
        #[source]
        source: ValueError,
    },

    /// The listing output is not the expected `{headings, data}` document.
    #[error("Malformed listing for {table}: {message}")]
    Listing {
        /// The table being listed.
        table: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl OvnError {
    /// Creates a decode error.
    pub fn decode(table: impl Into<String>, column: impl Into<String>, source: ValueError) -> Self {
        Self::Decode {
            table: table.into(),
            column: column.into(),
            source,
        }
    }

    /// Creates a malformed listing error.
    pub fn listing(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Listing {
            table: table.into(),
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
        matches!(
            self,
            OvnError::CommandFailed { .. } | OvnError::Timeout { .. } | OvnError::Exec { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_names_column() {
        let err = OvnError::decode(
            "ACL",
            "priority",
            ValueError::Mismatch {
                expected: "integer",
                actual: "\"x\"".to_string(),
            },
        );
        assert_eq!(
            err.to_string(),
            "Failed to decode ACL.priority: expected integer, got \"x\""
        );
    }

    #[test]
    fn test_command_failed() {
        let err = OvnError::CommandFailed {
            command: "ovn-nbctl list ACL".to_string(),
            exit_code: 1,
            output: "database connection failed".to_string(),
        };
        assert!(err.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_is_retryable() {
        let timeout = OvnError::Timeout {
            command: "ovn-nbctl".to_string(),
            timeout_secs: 8,
        };
        assert!(timeout.is_retryable());
        assert!(!OvnError::listing("ACL", "not an object").is_retryable());
        assert!(!OvnError::internal("bug").is_retryable());
    }
}
