//! Error types for profile store operations

use thiserror::Error;

/// Result type for profile store operations
pub type Result<T> = std::result::Result<T, ProfileStoreError>;

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failures and throttling, may succeed on retry
    Transient,

    /// Rejections that will never succeed on retry (access denied, quota, schema)
    Permanent,
}

/// Errors that can occur during profile store operations
#[derive(Error, Debug)]
pub enum ProfileStoreError {
    /// Transient backend failure (network error, throttling)
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Permanent backend failure (access denied, quota exhausted, value rejected)
    #[error("Permanent store error: {0}")]
    Permanent(String),

    /// Retry budget exhausted on transient failures
    #[error("Operation '{operation}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value does not have the expected document shape
    #[error("Corrupt document under key {key}: {reason}")]
    CorruptDocument { key: String, reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not valid for the current profile or runtime state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl ProfileStoreError {
    /// Classify this error for retry purposes.
    ///
    /// An exhausted retry budget is reported as transient: the underlying
    /// cause was transient, only the local patience ran out.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProfileStoreError::Transient(_) | ProfileStoreError::RetriesExhausted { .. } => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        }
    }

    /// Whether the error should be retried
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(
            ProfileStoreError::Transient("throttled".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ProfileStoreError::Permanent("access denied".into()).class(),
            ErrorClass::Permanent
        );
        assert!(ProfileStoreError::RetriesExhausted {
            operation: "update".into(),
            attempts: 3,
            last_error: "timeout".into(),
        }
        .is_transient());
        assert!(!ProfileStoreError::InvalidConfig("zero".into()).is_transient());
    }
}
