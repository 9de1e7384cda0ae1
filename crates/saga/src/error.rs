//! Saga error types.

use common::{AggregateId, ConfigurationId, SagaId};
use saga_store::StoreError;
use thiserror::Error;

use crate::state::{ActionState, SagaState};

/// Errors that escape the saga engine to its caller.
///
/// Step-level failures (unexpected results, timeouts, cancellation, failed
/// dispatches) are not errors: they are recorded on the action and drive the
/// state machine into compensation.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga is in an invalid state for the requested operation.
    #[error("Invalid saga state: expected {expected}, actual {actual}")]
    InvalidState { expected: String, actual: SagaState },

    /// Another in-flight saga owns the entity.
    #[error("Entity {entity_id} is locked by another {saga_type} saga")]
    Locked {
        saga_type: String,
        entity_id: AggregateId,
    },

    /// The lock check itself failed.
    #[error("Lock check failed: {0}")]
    LockCheck(String),

    /// The step list is empty or its sequences are not contiguous from 1.
    #[error("Invalid saga steps: {0}")]
    InvalidSteps(String),

    /// A result arrived for an action that is not awaiting one.
    #[error("Step {step} of saga {saga_id} is not running (state {state})")]
    ActionNotRunning {
        saga_id: SagaId,
        step: u32,
        state: ActionState,
    },

    /// No saga with the given id exists in the pool.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// No definition is registered for the saga type.
    #[error("Unknown saga type: {0}")]
    UnknownSagaType(String),

    /// The configuration referenced by a saga definition does not exist.
    #[error("Saga configuration not found: {0}")]
    ConfigurationMissing(ConfigurationId),

    /// No decoder is registered for a command name.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A command template could not be decoded.
    #[error("Invalid template for command '{command}': {reason}")]
    InvalidCommandTemplate { command: String, reason: String },

    /// Waiting for the per-saga persistence lock took too long.
    #[error("Timed out after {timeout_ms}ms waiting to persist saga {saga_id}")]
    PersistenceTimeout { saga_id: SagaId, timeout_ms: u128 },

    /// A result dispatcher was used before a pool bound it.
    #[error("Result dispatcher is not bound to a saga pool")]
    DispatcherUnbound,

    /// Re-attaching the business entity failed.
    #[error("Entity rehydration failed: {0}")]
    Rehydration(String),

    /// Store error, including concurrency conflicts on save.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if a save was rejected because the saga changed concurrently.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, SagaError::Store(StoreError::ConcurrencyConflict { .. }))
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
