use thiserror::Error;

use crate::{ETag, SagaId, Sequence};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored concurrency token did not match the one presented by the caller.
    #[error("Concurrency conflict for {id}: expected etag {expected}, found {actual:?}")]
    ConcurrencyConflict {
        id: String,
        expected: ETag,
        actual: Option<ETag>,
    },

    /// A document with the same id already exists.
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// The document was not found.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// Two writers raced for the same snapshot sequence number.
    #[error("Snapshot sequence {sequence} already taken for saga {saga_id}")]
    SequenceConflict { saga_id: SagaId, sequence: Sequence },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
