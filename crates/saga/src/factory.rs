//! Saga construction and reconstitution.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{AggregateId, ConfigurationId, ETag};

use crate::action::SagaStep;
use crate::command::CommandRegistry;
use crate::configuration::{SagaConfiguration, SagaConfigurationRepository};
use crate::dispatcher::CommandDispatcher;
use crate::error::{Result, SagaError};
use crate::evaluator::EvaluatorRegistry;
use crate::lock::LockHandler;
use crate::repository::SagaRepository;
use crate::saga::{Saga, SagaBindings};
use crate::snapshot::{SagaRecord, SagaSnapshot};

/// Where a saga type gets its steps from.
#[derive(Debug, Clone)]
pub enum SagaDefinition {
    /// A fixed step template.
    Steps(Vec<SagaStep>),
    /// A stored configuration, loaded each time a saga is created.
    Configuration(ConfigurationId),
}

/// Re-attaches the live business entity to a loaded saga.
#[async_trait]
pub trait EntityRehydrator: Send + Sync {
    /// Returns the entity, or None if it no longer exists.
    async fn rehydrate(
        &self,
        entity_id: AggregateId,
    ) -> Result<Option<Arc<dyn Any + Send + Sync>>>;
}

/// Builds sagas wired to their dispatcher, evaluators, lock handler and
/// repository.
pub struct SagaFactory {
    definitions: HashMap<String, SagaDefinition>,
    dispatcher: Arc<CommandDispatcher>,
    evaluators: EvaluatorRegistry,
    lock_handlers: HashMap<String, Arc<dyn LockHandler>>,
    repository: Option<Arc<SagaRepository>>,
    configurations: Option<SagaConfigurationRepository>,
    commands: CommandRegistry,
}

impl SagaFactory {
    /// Creates a factory using the default equality evaluators.
    pub fn new(dispatcher: CommandDispatcher) -> Self {
        Self {
            definitions: HashMap::new(),
            dispatcher: Arc::new(dispatcher),
            evaluators: EvaluatorRegistry::with_defaults(),
            lock_handlers: HashMap::new(),
            repository: None,
            configurations: None,
            commands: CommandRegistry::new(),
        }
    }

    /// Registers a saga type with a fixed step template.
    pub fn with_steps(mut self, saga_type: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        self.definitions
            .insert(saga_type.into(), SagaDefinition::Steps(steps));
        self
    }

    /// Registers a saga type backed by a stored configuration.
    pub fn with_configuration(
        mut self,
        saga_type: impl Into<String>,
        config_id: ConfigurationId,
    ) -> Self {
        self.definitions
            .insert(saga_type.into(), SagaDefinition::Configuration(config_id));
        self
    }

    /// Replaces the evaluator registry.
    pub fn with_evaluators(mut self, evaluators: EvaluatorRegistry) -> Self {
        self.evaluators = evaluators;
        self
    }

    /// Sets the lock handler consulted when sagas of `saga_type` start.
    pub fn with_lock_handler(
        mut self,
        saga_type: impl Into<String>,
        lock_handler: impl LockHandler + 'static,
    ) -> Self {
        self.lock_handlers
            .insert(saga_type.into(), Arc::new(lock_handler));
        self
    }

    /// Persists sagas through `repository`.
    pub fn with_repository(mut self, repository: Arc<SagaRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Resolves configuration-backed definitions through `configurations`,
    /// decoding their commands with `commands`.
    pub fn with_configurations(
        mut self,
        configurations: SagaConfigurationRepository,
        commands: CommandRegistry,
    ) -> Self {
        self.configurations = Some(configurations);
        self.commands = commands;
        self
    }

    pub fn repository(&self) -> Option<&Arc<SagaRepository>> {
        self.repository.as_ref()
    }

    /// Returns true if `saga_type` has a definition.
    pub fn defines(&self, saga_type: &str) -> bool {
        self.definitions.contains_key(saga_type)
    }

    /// Creates a new `Initial` saga of `saga_type`.
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, saga_type: &str) -> Result<Saga> {
        let definition = self
            .definitions
            .get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))?;

        let saga = match definition {
            SagaDefinition::Steps(steps) => Saga::new(
                saga_type,
                steps.iter().map(SagaStep::renewed).collect(),
                self.bindings(saga_type),
            )?,
            SagaDefinition::Configuration(config_id) => {
                let configuration = self.configuration(*config_id).await?;
                let steps = configuration.instantiate(&self.commands)?;
                Saga::new(saga_type, steps, self.bindings(saga_type))?
                    .with_configuration(configuration.id, configuration.name)
            }
        };

        tracing::debug!(saga_id = %saga.id(), "saga created");
        Ok(saga)
    }

    /// Rebuilds a saga from its current record.
    pub fn rehydrate(&self, record: SagaRecord, etag: ETag) -> Result<Saga> {
        let steps = record.complete_steps()?;
        let bindings = self.bindings(&record.saga_type);
        Saga::from_record(record, steps, Some(etag), bindings)
    }

    /// Rebuilds a saga from a pruned snapshot.
    ///
    /// Steps missing from the snapshot are taken from the saga type's
    /// template, or from the configuration the saga was created from, with
    /// the same action ids the saga gave them. The restored saga has no
    /// etag; its next persist recreates the record.
    pub async fn restore_from_snapshot(&self, snapshot: SagaSnapshot) -> Result<Saga> {
        let record = snapshot.record;
        let mut template = match (record.config_id, self.definitions.get(&record.saga_type)) {
            (Some(config_id), _) => self
                .configuration(config_id)
                .await?
                .instantiate(&self.commands)?,
            (None, Some(SagaDefinition::Steps(steps))) => {
                steps.iter().map(SagaStep::renewed).collect()
            }
            (None, Some(SagaDefinition::Configuration(config_id))) => self
                .configuration(*config_id)
                .await?
                .instantiate(&self.commands)?,
            (None, None) => return Err(SagaError::UnknownSagaType(record.saga_type)),
        };

        for step in &mut template {
            step.assign_ids(record.saga_id);
        }
        let steps = record.overlay(template)?;
        let bindings = self.bindings(&record.saga_type);
        Saga::from_record(record, steps, None, bindings)
    }

    async fn configuration(&self, config_id: ConfigurationId) -> Result<SagaConfiguration> {
        match &self.configurations {
            Some(configurations) => configurations.require(config_id).await,
            None => Err(SagaError::ConfigurationMissing(config_id)),
        }
    }

    fn bindings(&self, saga_type: &str) -> SagaBindings {
        SagaBindings {
            dispatcher: self.dispatcher.clone(),
            evaluators: self.evaluators.for_saga_type(saga_type),
            lock_handler: self.lock_handlers.get(saga_type).cloned(),
            repository: self.repository.clone(),
        }
    }
}

impl std::fmt::Debug for SagaFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaFactory")
            .field("saga_types", &self.definitions.keys().collect::<Vec<_>>())
            .field("evaluators", &self.evaluators.len())
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use saga_store::InMemorySagaStore;

    use super::*;
    use crate::action::SagaAction;
    use crate::command::{Command, CommandTemplate, ResultKind};
    use crate::configuration::{ActionTemplate, StepTemplate};
    use crate::handlers::InMemoryLockHandler;
    use crate::state::SagaState;

    fn steps() -> Vec<SagaStep> {
        vec![SagaStep::new(
            1,
            SagaAction::new(Command::expecting("create_order", "Pending")),
            SagaAction::new(Command::expecting("reject_order", "Rejected")),
        )]
    }

    #[tokio::test]
    async fn test_create_from_steps() {
        let factory = SagaFactory::new(CommandDispatcher::new())
            .with_steps("CreateOrderSaga", steps())
            .with_lock_handler("CreateOrderSaga", InMemoryLockHandler::new());

        let first = factory.create("CreateOrderSaga").await.unwrap();
        let second = factory.create("CreateOrderSaga").await.unwrap();

        assert_eq!(first.state(), SagaState::Initial);
        assert_ne!(first.id(), second.id());
        assert_ne!(
            first.steps()[0].action().id(),
            second.steps()[0].action().id()
        );
    }

    #[tokio::test]
    async fn test_create_unknown_type() {
        let factory = SagaFactory::new(CommandDispatcher::new());
        let result = factory.create("ShipOrderSaga").await;
        assert!(matches!(result, Err(SagaError::UnknownSagaType(t)) if t == "ShipOrderSaga"));
    }

    #[tokio::test]
    async fn test_create_from_configuration() {
        let store = Arc::new(InMemorySagaStore::new());
        let configurations = SagaConfigurationRepository::new(store);
        let configuration = configurations
            .add(SagaConfiguration::new(
                "CreateOrder",
                vec![StepTemplate::new(
                    1,
                    ActionTemplate::new(CommandTemplate::new("create_order", Some("Pending".into()))),
                    ActionTemplate::new(CommandTemplate::new("reject_order", Some("Rejected".into()))),
                )],
            ))
            .await
            .unwrap();
        let commands = CommandRegistry::new()
            .register("create_order", Some(ResultKind::Text))
            .register("reject_order", Some(ResultKind::Text));

        let factory = SagaFactory::new(CommandDispatcher::new())
            .with_configuration("CreateOrderSaga", configuration.id)
            .with_configurations(configurations, commands);

        let saga = factory.create("CreateOrderSaga").await.unwrap();
        assert_eq!(saga.config_id(), Some(configuration.id));
        assert_eq!(saga.config_name(), Some("CreateOrder"));
        assert_eq!(saga.steps()[0].action().command().name(), "create_order");
    }

    #[tokio::test]
    async fn test_create_with_missing_configuration() {
        let configurations = SagaConfigurationRepository::new(Arc::new(InMemorySagaStore::new()));
        let missing = ConfigurationId::new();
        let factory = SagaFactory::new(CommandDispatcher::new())
            .with_configuration("CreateOrderSaga", missing)
            .with_configurations(configurations, CommandRegistry::new());

        let result = factory.create("CreateOrderSaga").await;
        assert!(matches!(result, Err(SagaError::ConfigurationMissing(id)) if id == missing));
    }

    #[tokio::test]
    async fn test_rehydrate_from_record() {
        let factory = SagaFactory::new(CommandDispatcher::new()).with_steps("CreateOrderSaga", steps());
        let saga = factory.create("CreateOrderSaga").await.unwrap();
        let etag = ETag::new();

        let restored = factory.rehydrate(saga.to_record(), etag).unwrap();

        assert_eq!(restored.id(), saga.id());
        assert_eq!(restored.etag(), Some(etag));
        assert_eq!(restored.steps(), saga.steps());
    }

    #[tokio::test]
    async fn test_restore_from_snapshot_keeps_unrun_steps() {
        let repository = Arc::new(SagaRepository::new(
            Arc::new(InMemorySagaStore::new()),
            &crate::config::SagaEngineConfig::default(),
        ));
        let handler = crate::handlers::RecordingCommandHandler::new();
        let dispatcher = CommandDispatcher::new()
            .register("create_order", handler.clone())
            .register("reserve_credit", handler);
        let mut steps = steps();
        steps.push(SagaStep::new(
            2,
            SagaAction::new(Command::expecting("reserve_credit", true)),
            SagaAction::new(Command::expecting("release_credit", true)),
        ));
        let factory = SagaFactory::new(dispatcher)
            .with_steps("CreateOrderSaga", steps)
            .with_repository(repository.clone());

        let mut saga = factory.create("CreateOrderSaga").await.unwrap();
        saga.start(AggregateId::new(), tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        let snapshot = repository.latest_snapshot(saga.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.record.steps.len(), 1);

        let restored = factory.restore_from_snapshot(snapshot).await.unwrap();

        assert_eq!(restored.id(), saga.id());
        assert_eq!(restored.current_step(), saga.current_step());
        assert_eq!(restored.state(), saga.state());
        assert_eq!(restored.steps(), saga.steps());
    }
}
