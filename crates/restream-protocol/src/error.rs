//! Error types for the research progress engine.

use thiserror::Error;

/// Errors that can occur while reconciling, resolving, or persisting.
///
/// None of these are fatal to a session: callers log them and degrade.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("metadata lookup failed: {0}")]
    Metadata(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
