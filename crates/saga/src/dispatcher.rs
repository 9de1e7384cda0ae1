//! Command dispatch and result routing.
//!
//! A saga hands each action's command to the [`CommandDispatcher`], which
//! invokes the single handler registered for the command name. The handler
//! performs the side effect and, possibly much later and from another call
//! stack, reports the outcome through a [`ResultDispatcher`], which finds the
//! originating saga in its pool and feeds it the result.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use common::SagaId;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::command::{Command, ResultValue};
use crate::error::{Result, SagaError};
use crate::pool::SagaPool;

/// A command handler could not perform its side effect.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A command could not be dispatched.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("No handler registered for command '{command}'")]
    NoHandler { command: String },

    #[error("Handler for command '{command}' failed: {reason}")]
    HandlerFailed { command: String, reason: String },
}

/// Performs a side effect for a command.
///
/// The result, if any, is reported by some other party through a
/// [`ResultDispatcher`] (e.g. a consumer of the reply message).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> std::result::Result<(), HandlerError>;
}

/// Performs a side effect and reports the result itself.
#[async_trait]
pub trait ResultDispatchingHandler: Send + Sync {
    async fn handle(
        &self,
        command: Command,
        results: Arc<ResultDispatcher>,
    ) -> std::result::Result<(), HandlerError>;
}

#[derive(Clone)]
enum RegisteredHandler {
    Plain(Arc<dyn CommandHandler>),
    ResultDispatching(Arc<dyn ResultDispatchingHandler>, Arc<ResultDispatcher>),
}

/// Routes commands to handlers by command name.
#[derive(Clone, Default)]
pub struct CommandDispatcher {
    handlers: HashMap<String, RegisteredHandler>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plain side-effecting handler. Replaces any previous
    /// handler for the same command.
    pub fn register(
        mut self,
        command: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Self {
        self.handlers
            .insert(command.into(), RegisteredHandler::Plain(Arc::new(handler)));
        self
    }

    /// Registers a handler that reports results through `results`.
    pub fn register_result_dispatching(
        mut self,
        command: impl Into<String>,
        handler: impl ResultDispatchingHandler + 'static,
        results: Arc<ResultDispatcher>,
    ) -> Self {
        self.handlers.insert(
            command.into(),
            RegisteredHandler::ResultDispatching(Arc::new(handler), results),
        );
        self
    }

    /// Returns true if a handler is registered for `command`.
    pub fn handles(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    /// Invokes the handler registered for the command's name.
    pub async fn dispatch(&self, command: Command) -> std::result::Result<(), DispatchError> {
        let name = command.name().to_string();
        let handler = self
            .handlers
            .get(&name)
            .ok_or_else(|| DispatchError::NoHandler {
                command: name.clone(),
            })?;

        let outcome = match handler {
            RegisteredHandler::Plain(handler) => handler.handle(command).await,
            RegisteredHandler::ResultDispatching(handler, results) => {
                handler.handle(command, results.clone()).await
            }
        };

        outcome.map_err(|e| DispatchError::HandlerFailed {
            command: name,
            reason: e.message,
        })
    }
}

/// Feeds command results back to the saga that issued the command.
///
/// A dispatcher holds only a weak reference to its pool; the pool binds
/// matching dispatchers to itself whenever it hands out a saga.
pub struct ResultDispatcher {
    saga_type: Option<String>,
    pool: RwLock<Option<Weak<dyn SagaPool>>>,
}

impl ResultDispatcher {
    /// Creates a dispatcher serving sagas of every type.
    pub fn new() -> Self {
        Self {
            saga_type: None,
            pool: RwLock::new(None),
        }
    }

    /// Creates a dispatcher serving only sagas of `saga_type`.
    pub fn scoped(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: Some(saga_type.into()),
            pool: RwLock::new(None),
        }
    }

    /// Returns the saga type this dispatcher serves, if scoped.
    pub fn saga_type(&self) -> Option<&str> {
        self.saga_type.as_deref()
    }

    /// Returns true if this dispatcher serves sagas of `saga_type`.
    pub fn applies_to(&self, saga_type: &str) -> bool {
        self.saga_type.as_deref().is_none_or(|t| t == saga_type)
    }

    /// Points the dispatcher at a pool.
    pub async fn bind(&self, pool: Weak<dyn SagaPool>) {
        *self.pool.write().await = Some(pool);
    }

    /// Returns true if the dispatcher is bound to a live pool.
    pub async fn is_bound(&self) -> bool {
        self.pool
            .read()
            .await
            .as_ref()
            .is_some_and(|p| p.strong_count() > 0)
    }

    /// Delivers a result to the saga with id `saga_id`.
    ///
    /// `compensating` tells the saga whether the result belongs to the
    /// current step's compensating action rather than its forward action.
    #[tracing::instrument(skip(self, result), fields(result_kind = %result.kind()))]
    pub async fn dispatch_result(
        &self,
        saga_id: SagaId,
        result: ResultValue,
        compensating: bool,
    ) -> Result<()> {
        let pool = self
            .pool
            .read()
            .await
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(SagaError::DispatcherUnbound)?;

        let saga = pool
            .get_saga(saga_id, None)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;

        {
            let mut guard = saga.lock().await;
            guard.handle_result(result, compensating).await?;
        }

        pool.replace_saga(saga).await
    }
}

impl Default for ResultDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultDispatcher")
            .field("saga_type", &self.saga_type)
            .finish_non_exhaustive()
    }
}
