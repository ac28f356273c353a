use thiserror::Error;

use crate::{OrderId, Version};

/// Errors that can occur when interacting with a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An entity with the same identity is already stored.
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// A compare-and-swap write lost against a concurrent writer.
    /// The caller should re-read the aggregate and retry.
    #[error("Version conflict for order {order_id}: expected version {expected}")]
    VersionConflict { order_id: OrderId, expected: Version },

    /// An idempotency key was reused with a different request fingerprint.
    #[error("Idempotency key {key} was already used with a different request")]
    HashMismatch { key: String },

    /// The idempotency key was empty.
    #[error("Idempotency key is required")]
    KeyRequired,

    /// The request fingerprint was empty.
    #[error("Request hash is required")]
    RequestHashRequired,

    /// An outbox operation referenced a message that does not exist.
    #[error("Publish failed: outbox message not found: {message_id}")]
    PublishFailed { message_id: String },

    /// An idempotency record already reached a terminal status.
    #[error("Idempotency key {key} is already {status}")]
    AlreadyCompleted { key: String, status: &'static str },

    /// A batched operation was cancelled between batches.
    #[error("Operation cancelled after {completed} rows")]
    Cancelled { completed: u64 },

    /// A persisted value could not be decoded.
    #[error("Invalid value {value:?} in column {column}")]
    Decode { column: &'static str, value: String },

    /// A database error occurred.
    #[error("Database error during {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Returns true for a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Returns true for contention outcomes (duplicate identity or stale version).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists { .. } | StoreError::VersionConflict { .. }
        )
    }

    /// Returns true when retrying the same call, possibly after a re-read, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Database { .. }
        )
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Attaches the failing operation's name to a database error.
pub(crate) trait DbContext<T> {
    fn context(self, operation: &'static str) -> Result<T>;
}

impl<T> DbContext<T> for std::result::Result<T, sqlx::Error> {
    fn context(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| StoreError::Database { operation, source })
    }
}

/// Returns true if the error is a violation of the named unique constraint.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.is_unique_violation() && db_err.constraint() == Some(constraint);
    }
    false
}
