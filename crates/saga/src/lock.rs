//! Advisory per-entity lock checks.
//!
//! A lock check asks whether a business entity is already owned by an
//! in-flight saga. What "owned" means (e.g. "the order is still Pending") is
//! up to the handler. The engine holds no mutex around the check, so it is
//! only as strong as the handler's backing store.

use async_trait::async_trait;
use common::AggregateId;
use thiserror::Error;

/// The lock check could not be performed.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LockError {
    pub message: String,
}

impl LockError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Checks whether an entity is locked for a saga type.
#[async_trait]
pub trait LockHandler: Send + Sync {
    /// Returns true if `entity_id` is already owned by an in-flight saga.
    async fn is_locked(&self, entity_id: AggregateId) -> Result<bool, LockError>;
}
