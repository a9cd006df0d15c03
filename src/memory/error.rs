//! Error taxonomy for memory graph operations.

use thiserror::Error;

/// Errors surfaced by the memory graph.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed input, rejected before any write.
    #[error("validation error: {0}")]
    Validation(String),

    /// A substrate is temporarily unreachable; retry with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A stored fragment failed structural validation on read.
    #[error("fragment {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    /// Optimistic-concurrency retry budget exhausted.
    #[error("contention on fragment {id} after {attempts} attempts")]
    Contention { id: String, attempts: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    /// The requested supersession edge would close a cycle.
    #[error("supersession {new_id} -> {old_id} would create a cycle")]
    SupersessionCycle { new_id: String, old_id: String },

    /// The debate oracle did not answer within its deadline.
    #[error("debate oracle timed out after {0}s")]
    OracleTimeout(u64),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    /// Whether the caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Contention { .. })
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure,
            ) => MemoryError::StorageUnavailable(err.to_string()),
            _ => MemoryError::Database(err),
        }
    }
}

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;
