//! Error types for the memory engine.
//!
//! One closed sum covers every foreground failure the engine can surface.
//! Informational outcomes (fold rejections, sampling vacancies, cache
//! misses) are modelled as structured results, not errors.

use crate::embeddings::EmbeddingError;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Caller supplied invalid input (empty content, oversized text, bad value)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Memory does not exist or has been soft-deleted
    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    /// Unknown or disallowed tier value
    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    /// Embedding generation failed
    #[error("Embedding failed: {0}")]
    EmbedFailed(String),

    /// All embedding providers are unavailable
    #[error("Embedding substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// Persistent store failed; the SQLite error is kept as source,
    /// not rendered into the message
    #[error("Storage operation failed")]
    StorageFailed(#[source] rusqlite::Error),

    /// A stored config value could not be parsed
    #[error("Invalid config value for '{key}': {value}")]
    ConfigInvalid { key: String, value: String },

    /// A unique constraint was violated outside the expected dedup path
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, ref msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CoreError::Conflict(msg.clone().unwrap_or_else(|| "unique constraint".into()))
            }
            other => CoreError::StorageFailed(other),
        }
    }
}

impl From<EmbeddingError> for CoreError {
    fn from(e: EmbeddingError) -> Self {
        match e {
            EmbeddingError::InvalidInput(msg) => CoreError::InvalidInput(msg),
            EmbeddingError::AllProvidersFailed(msg) => CoreError::SubstrateUnavailable(msg),
            other => CoreError::EmbedFailed(other.to_string()),
        }
    }
}

/// Engine result type
pub type Result<T> = std::result::Result<T, CoreError>;
