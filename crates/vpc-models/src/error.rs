//! Error types for model decoding.

use thiserror::Error;

/// Result type alias for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors that can occur while building the model graph.
#[derive(Debug, Error)]
pub enum ModelError {
    /// A fetched record did not deserialize into its resource type.
    #[error("Failed to decode {kind} record: {source}")]
    Decode {
        /// Remote resource kind (e.g. "vpcs").
        kind: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A decoded record has no usable key.
    #[error("{kind} record has an empty key")]
    EmptyKey {
        /// Remote resource kind.
        kind: &'static str,
    },
}

impl ModelError {
    /// Creates a decode error.
    pub fn decode(kind: &'static str, source: serde_json::Error) -> Self {
        Self::Decode { kind, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelError::EmptyKey { kind: "vpcs" };
        assert_eq!(err.to_string(), "vpcs record has an empty key");
    }
}
