//! In-memory collaborators for tests and demos.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::AggregateId;

use crate::command::{Command, ResultValue};
use crate::dispatcher::{CommandHandler, HandlerError, ResultDispatcher, ResultDispatchingHandler};
use crate::error::Result;
use crate::factory::EntityRehydrator;
use crate::lock::{LockError, LockHandler};

#[derive(Debug, Default)]
struct RecordingState {
    commands: Vec<Command>,
    fail_on_dispatch: bool,
}

/// Records every dispatched command. Results are reported by the test.
#[derive(Debug, Clone, Default)]
pub struct RecordingCommandHandler {
    state: Arc<RwLock<RecordingState>>,
}

impl RecordingCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the handler to reject dispatched commands.
    pub fn set_fail_on_dispatch(&self, fail: bool) {
        self.state.write().unwrap().fail_on_dispatch = fail;
    }

    /// Returns the commands handled so far, in dispatch order.
    pub fn commands(&self) -> Vec<Command> {
        self.state.read().unwrap().commands.clone()
    }

    pub fn command_count(&self) -> usize {
        self.state.read().unwrap().commands.len()
    }

    /// Returns the names of the commands handled so far.
    pub fn command_names(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .commands
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

#[async_trait]
impl CommandHandler for RecordingCommandHandler {
    async fn handle(&self, command: Command) -> std::result::Result<(), HandlerError> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_dispatch {
            return Err(HandlerError::new(format!(
                "command '{}' rejected",
                command.name()
            )));
        }
        state.commands.push(command);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ReplyingState {
    replies: HashMap<String, VecDeque<ResultValue>>,
    handled: Vec<Command>,
}

/// Replies to commands from a separate task with configured results.
///
/// Commands without a configured reply are answered with their expected
/// result. The reply is dispatched as a compensating result if the command
/// name was registered through [`ReplyingCommandHandler::compensating`].
#[derive(Debug, Clone, Default)]
pub struct ReplyingCommandHandler {
    state: Arc<RwLock<ReplyingState>>,
    compensating: Arc<RwLock<HashSet<String>>>,
}

impl ReplyingCommandHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `command` as a compensating command.
    pub fn compensating(self, command: impl Into<String>) -> Self {
        self.compensating.write().unwrap().insert(command.into());
        self
    }

    /// Queues a reply for the next dispatch of `command`.
    pub fn reply_with(&self, command: impl Into<String>, result: impl Into<ResultValue>) {
        self.state
            .write()
            .unwrap()
            .replies
            .entry(command.into())
            .or_default()
            .push_back(result.into());
    }

    /// Returns the names of the commands handled so far.
    pub fn command_names(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap()
            .handled
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

#[async_trait]
impl ResultDispatchingHandler for ReplyingCommandHandler {
    async fn handle(
        &self,
        command: Command,
        results: Arc<ResultDispatcher>,
    ) -> std::result::Result<(), HandlerError> {
        let saga_id = command
            .saga_id()
            .ok_or_else(|| HandlerError::new("command is not bound to a saga"))?;

        let reply = {
            let mut state = self.state.write().unwrap();
            state.handled.push(command.clone());
            state
                .replies
                .get_mut(command.name())
                .and_then(VecDeque::pop_front)
                .or_else(|| command.expected_result().cloned())
                .unwrap_or(ResultValue::Unit)
        };
        let compensating = self.compensating.read().unwrap().contains(command.name());

        tokio::spawn(async move {
            if let Err(e) = results.dispatch_result(saga_id, reply, compensating).await {
                tracing::warn!(%saga_id, error = %e, "failed to deliver command result");
            }
        });
        Ok(())
    }
}

/// Lock handler over an in-memory set of locked entities.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockHandler {
    locked: Arc<RwLock<HashSet<AggregateId>>>,
}

impl InMemoryLockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, entity_id: AggregateId) {
        self.locked.write().unwrap().insert(entity_id);
    }

    pub fn unlock(&self, entity_id: AggregateId) {
        self.locked.write().unwrap().remove(&entity_id);
    }
}

#[async_trait]
impl LockHandler for InMemoryLockHandler {
    async fn is_locked(&self, entity_id: AggregateId) -> std::result::Result<bool, LockError> {
        Ok(self.locked.read().unwrap().contains(&entity_id))
    }
}

/// Entity rehydrator over an in-memory map.
#[derive(Clone, Default)]
pub struct InMemoryEntityRehydrator {
    entities: Arc<RwLock<HashMap<AggregateId, Arc<dyn Any + Send + Sync>>>>,
}

impl InMemoryEntityRehydrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Any + Send + Sync>(&self, entity_id: AggregateId, entity: T) {
        self.entities
            .write()
            .unwrap()
            .insert(entity_id, Arc::new(entity));
    }
}

#[async_trait]
impl EntityRehydrator for InMemoryEntityRehydrator {
    async fn rehydrate(
        &self,
        entity_id: AggregateId,
    ) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        Ok(self.entities.read().unwrap().get(&entity_id).cloned())
    }
}

impl std::fmt::Debug for InMemoryEntityRehydrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEntityRehydrator")
            .field("entities", &self.entities.read().unwrap().len())
            .finish()
    }
}
