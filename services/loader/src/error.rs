//! Error taxonomy shared by the parser, the retry loop and the dispatcher.

use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Coarse failure class, used for logging and for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad JSON or a record missing a required field; scoped to one file
    MalformedInput,
    /// A single write attempt failed and may be retried
    PersistenceTransient,
    /// Every write attempt for a batch failed; the batch was dropped
    PersistenceFailed,
    /// Database or schema creation failed at startup
    SchemaBootstrapFailed,
    /// The drop file could not be opened or read
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedInput => "MALFORMED_INPUT",
            ErrorKind::PersistenceTransient => "PERSISTENCE_TRANSIENT",
            ErrorKind::PersistenceFailed => "PERSISTENCE_FAILED",
            ErrorKind::SchemaBootstrapFailed => "SCHEMA_BOOTSTRAP_FAILED",
            ErrorKind::Io => "IO",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while ingesting drop files
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Failed to read drop file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write attempt failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("Write failed after {attempts} attempts: {source}")]
    PersistenceFailed {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Schema bootstrap failed: {0}")]
    SchemaBootstrap(#[source] StoreError),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::MalformedInput(_) => ErrorKind::MalformedInput,
            IngestError::Io(_) => ErrorKind::Io,
            IngestError::Persistence(_) => ErrorKind::PersistenceTransient,
            IngestError::PersistenceFailed { .. } => ErrorKind::PersistenceFailed,
            IngestError::SchemaBootstrap(_) => ErrorKind::SchemaBootstrapFailed,
        }
    }

    /// Only store-layer failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::PersistenceTransient
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            IngestError::Io(e.into())
        } else {
            IngestError::MalformedInput(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::MalformedInput.as_str(), "MALFORMED_INPUT");
        assert_eq!(ErrorKind::PersistenceFailed.to_string(), "PERSISTENCE_FAILED");
        assert_eq!(
            ErrorKind::SchemaBootstrapFailed.as_str(),
            "SCHEMA_BOOTSTRAP_FAILED"
        );
    }

    #[test]
    fn test_only_persistence_is_retryable() {
        let transient = IngestError::Persistence(StoreError::Database(sqlx::Error::PoolTimedOut));
        assert!(transient.is_retryable());

        let malformed = IngestError::MalformedInput("missing field".to_string());
        assert!(!malformed.is_retryable());

        let exhausted = IngestError::PersistenceFailed {
            attempts: 3,
            source: StoreError::Database(sqlx::Error::PoolClosed),
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.kind(), ErrorKind::PersistenceFailed);
    }

    #[test]
    fn test_json_syntax_error_is_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{\"a\": ").unwrap_err();
        let err = IngestError::from(err);
        assert_eq!(err.kind(), ErrorKind::MalformedInput);
    }
}
