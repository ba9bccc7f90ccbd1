//! Common error types for SyncBridge.

use thiserror::Error;

use crate::types::Source;

/// Top-level error type for SyncBridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation log could not durably record a local mutation.
    ///
    /// Fatal to the calling mutation; must never be swallowed.
    #[error("Operation log unavailable: {0}")]
    LogUnavailable(String),

    /// A version vector commit raced with another writer.
    #[error("Stale write for {entity}: stored vector changed since it was read")]
    StaleWrite { entity: String },

    /// A remote adapter call failed.
    #[error("Adapter error ({system}): {message}")]
    Adapter {
        system: Source,
        message: String,
        retryable: bool,
    },

    /// Concurrent divergence with no configured way to settle it.
    #[error("Unresolvable conflict for {entity}: {reason}")]
    UnresolvableConflict { entity: String, reason: String },

    /// A ledger status transition that the state machine forbids.
    #[error("Invalid transition for transaction {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        transaction_id: String,
        from: String,
        to: String,
    },

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration is missing or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Create a retryable adapter error (timeouts, 5xx-equivalents).
    pub fn adapter_transient(system: Source, message: impl Into<String>) -> Self {
        Self::Adapter {
            system,
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable adapter error.
    pub fn adapter_fatal(system: Source, message: impl Into<String>) -> Self {
        Self::Adapter {
            system,
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the orchestrator may retry the failed cycle with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Adapter { retryable, .. } => *retryable,
            Error::StaleWrite { .. } | Error::Io(_) | Error::Storage(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::adapter_transient(Source::SystemA, "timeout").is_retryable());
        assert!(!Error::adapter_fatal(Source::SystemB, "bad request").is_retryable());
        assert!(Error::StaleWrite {
            entity: "course/1".to_string()
        }
        .is_retryable());
        assert!(!Error::LogUnavailable("disk full".to_string()).is_retryable());
        assert!(!Error::UnresolvableConflict {
            entity: "course/1".to_string(),
            reason: "no policy".to_string(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::adapter_transient(Source::SystemA, "503");
        assert_eq!(err.to_string(), "Adapter error (system_a): 503");
    }
}
