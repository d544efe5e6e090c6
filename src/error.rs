//! Storage error taxonomy.
//!
//! Lock contention and id collisions are absorbed by the store's retry layer;
//! only [`StoreError::Unavailable`] is meant to reach a caller unchanged.

use thiserror::Error;

/// Errors raised by the storage engine and its backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No storage backend could be opened at all.
    #[error("no storage backend found: {0}")]
    Unavailable(String),

    /// The store file is busy or locked by another writer.
    #[error("database is locked: {0}")]
    Locked(String),

    /// An insert collided with an existing memory id.
    #[error("id collision: {0}")]
    IdCollision(String),

    /// Requested memory does not exist.
    #[error("memory not found: {0}")]
    NotFound(String),

    /// The shell backend reported an error.
    #[error("backend error: {0}")]
    Backend(String),

    /// Native SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// True for "busy"/"locked" conditions that should be retried.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Locked(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("database is locked") || msg.contains("database is busy")
            }
            _ => false,
        }
    }

    /// True for primary-key / unique violations (id collisions on insert).
    pub fn is_constraint(&self) -> bool {
        match self {
            Self::IdCollision(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            Self::Backend(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("unique constraint") || msg.contains("constraint failed")
            }
            _ => false,
        }
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_messages_are_classified() {
        assert!(StoreError::backend("Error: database is locked").is_busy());
        assert!(StoreError::backend("Runtime error near line 1: UNIQUE constraint failed: memories.id").is_constraint());
        assert!(!StoreError::backend("no such table: memories").is_busy());
        assert!(!StoreError::not_found("mem-001").is_constraint());
    }

    #[test]
    fn native_busy_is_classified() {
        let err = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(err.is_busy());
        assert!(!err.is_constraint());
    }

    #[test]
    fn unavailable_message_mentions_backend() {
        let err = StoreError::Unavailable("sqlite3 not on PATH".into());
        assert!(err.to_string().contains("no storage backend found"));
    }
}
