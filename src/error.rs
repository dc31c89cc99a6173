//! Typed error taxonomy shared by every store operation.
//!
//! Calling layers (hooks, dashboard backends, tool handlers) match on the
//! variant instead of the message. [`TroveError::is_retryable`] identifies the
//! one transient condition, lock contention.

use rusqlite::ErrorCode;
use thiserror::Error;

pub type TroveResult<T> = Result<T, TroveError>;

#[derive(Debug, Error)]
pub enum TroveError {
    /// Bad input shape: empty content, importance out of range, self-loop, ...
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The write lock could not be acquired within the bounded wait.
    #[error("store busy: write lock not acquired within timeout")]
    StoreBusy,

    /// Semantic scoring was requested but no query embedding can be produced.
    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A single item failed to propagate into the global index.
    #[error("sync conflict for {memory_id} from {project_path}: {reason}")]
    SyncConflict {
        project_path: String,
        memory_id: String,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TroveError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// `true` only for lock contention; every other error is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreBusy)
    }
}

impl From<rusqlite::Error> for TroveError {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => Self::StoreBusy,
            _ => Self::Database(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_sqlite_error_maps_to_store_busy() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let mapped: TroveError = err.into();
        assert!(matches!(mapped, TroveError::StoreBusy));
        assert!(mapped.is_retryable());
    }

    #[test]
    fn other_sqlite_errors_stay_database_errors() {
        let mapped: TroveError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(mapped, TroveError::Database(_)));
        assert!(!mapped.is_retryable());
    }

    #[test]
    fn not_found_message_names_kind() {
        let err = TroveError::not_found("memory", "mem_123");
        assert_eq!(err.to_string(), "memory not found: mem_123");
    }
}
