//! Externally stored saga definitions.
//!
//! A configuration holds the step template new sagas are seeded from. Its
//! commands are stored as name plus expected result only and are turned back
//! into live commands through the [`CommandRegistry`].

use std::sync::Arc;
use std::time::Duration;

use common::{ConfigurationId, ETag};
use saga_store::{ConfigurationDocument, ConfigurationStore};
use serde::{Deserialize, Serialize};

use crate::action::{SagaAction, SagaStep, validate_sequences};
use crate::command::{CommandRegistry, CommandTemplate};
use crate::error::{Result, SagaError};

/// A stateless action template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub command: CommandTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_reverse_on_failure")]
    pub reverse_on_failure: bool,
}

fn default_reverse_on_failure() -> bool {
    true
}

impl ActionTemplate {
    pub fn new(command: CommandTemplate) -> Self {
        Self {
            command,
            timeout: None,
            reverse_on_failure: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_reverse_on_failure(mut self, reverse_on_failure: bool) -> Self {
        self.reverse_on_failure = reverse_on_failure;
        self
    }

    fn instantiate(&self, commands: &CommandRegistry) -> Result<SagaAction> {
        let mut action = SagaAction::new(commands.decode(&self.command)?)
            .with_reverse_on_failure(self.reverse_on_failure);
        if let Some(timeout) = self.timeout {
            action = action.with_timeout(timeout);
        }
        Ok(action)
    }
}

impl From<&SagaAction> for ActionTemplate {
    fn from(action: &SagaAction) -> Self {
        Self {
            command: action.command().to_template(),
            timeout: action.timeout(),
            reverse_on_failure: action.reverse_on_failure(),
        }
    }
}

/// A step template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub sequence: u32,
    pub action: ActionTemplate,
    pub compensating_action: ActionTemplate,
}

impl StepTemplate {
    pub fn new(sequence: u32, action: ActionTemplate, compensating_action: ActionTemplate) -> Self {
        Self {
            sequence,
            action,
            compensating_action,
        }
    }
}

impl From<&SagaStep> for StepTemplate {
    fn from(step: &SagaStep) -> Self {
        Self {
            sequence: step.sequence(),
            action: step.action().into(),
            compensating_action: step.compensating_action().into(),
        }
    }
}

/// A named, versioned saga definition.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfiguration {
    pub id: ConfigurationId,
    pub name: String,
    pub etag: Option<ETag>,
    pub steps: Vec<StepTemplate>,
}

impl SagaConfiguration {
    /// Creates an unsaved configuration with a fresh id.
    pub fn new(name: impl Into<String>, steps: Vec<StepTemplate>) -> Self {
        Self {
            id: ConfigurationId::new(),
            name: name.into(),
            etag: None,
            steps,
        }
    }

    /// Derives a configuration from live steps, dropping their runtime state.
    pub fn from_steps(name: impl Into<String>, steps: &[SagaStep]) -> Self {
        Self::new(name, steps.iter().map(StepTemplate::from).collect())
    }

    /// Builds fresh, never-run steps from the template.
    pub fn instantiate(&self, commands: &CommandRegistry) -> Result<Vec<SagaStep>> {
        let steps = self
            .steps
            .iter()
            .map(|template| {
                Ok(SagaStep::new(
                    template.sequence,
                    template.action.instantiate(commands)?,
                    template.compensating_action.instantiate(commands)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        validate_sequences(&steps).map_err(SagaError::InvalidSteps)?;
        Ok(steps)
    }

    fn to_document(&self) -> Result<ConfigurationDocument> {
        let mut document = ConfigurationDocument::new(
            self.id,
            self.name.clone(),
            serde_json::to_value(&self.steps)?,
        );
        document.etag = self.etag;
        Ok(document)
    }

    fn from_document(document: ConfigurationDocument) -> Result<Self> {
        Ok(Self {
            id: document.id,
            name: document.name,
            etag: document.etag,
            steps: serde_json::from_value(document.definition)?,
        })
    }
}

/// Get/add/update/remove of saga configurations.
#[derive(Clone)]
pub struct SagaConfigurationRepository {
    store: Arc<dyn ConfigurationStore>,
}

impl SagaConfigurationRepository {
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: ConfigurationId) -> Result<Option<SagaConfiguration>> {
        match self.store.get_configuration(id).await? {
            Some(document) => Ok(Some(SagaConfiguration::from_document(document)?)),
            None => Ok(None),
        }
    }

    /// Loads a configuration, failing with `ConfigurationMissing` if absent.
    pub async fn require(&self, id: ConfigurationId) -> Result<SagaConfiguration> {
        self.get(id)
            .await?
            .ok_or(SagaError::ConfigurationMissing(id))
    }

    /// Stores a new configuration. Returns it with its etag.
    pub async fn add(&self, configuration: SagaConfiguration) -> Result<SagaConfiguration> {
        let stored = self
            .store
            .add_configuration(configuration.to_document()?)
            .await?;
        SagaConfiguration::from_document(stored)
    }

    /// Replaces a configuration. Its etag must match the stored one.
    pub async fn update(&self, configuration: SagaConfiguration) -> Result<SagaConfiguration> {
        let expected = configuration
            .etag
            .ok_or(SagaError::ConfigurationMissing(configuration.id))?;
        let stored = self
            .store
            .update_configuration(expected, configuration.to_document()?)
            .await?;
        SagaConfiguration::from_document(stored)
    }

    pub async fn remove(&self, id: ConfigurationId) -> Result<()> {
        self.store.remove_configuration(id).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SagaConfigurationRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaConfigurationRepository")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use saga_store::InMemorySagaStore;

    use super::*;
    use crate::command::ResultKind;
    use crate::state::ActionState;

    fn registry() -> CommandRegistry {
        CommandRegistry::new()
            .register("create_order", Some(ResultKind::Text))
            .register("reject_order", Some(ResultKind::Text))
            .register("reserve_credit", Some(ResultKind::Boolean))
            .register("release_credit", Some(ResultKind::Boolean))
    }

    fn configuration() -> SagaConfiguration {
        SagaConfiguration::new(
            "CreateOrder",
            vec![
                StepTemplate::new(
                    1,
                    ActionTemplate::new(CommandTemplate::new(
                        "create_order",
                        Some("Pending".into()),
                    )),
                    ActionTemplate::new(CommandTemplate::new(
                        "reject_order",
                        Some("Rejected".into()),
                    )),
                ),
                StepTemplate::new(
                    2,
                    ActionTemplate::new(CommandTemplate::new("reserve_credit", Some(true.into())))
                        .with_timeout(Duration::from_secs(30)),
                    ActionTemplate::new(CommandTemplate::new("release_credit", Some(true.into()))),
                ),
            ],
        )
    }

    #[test]
    fn test_instantiate_builds_fresh_steps() {
        let steps = configuration().instantiate(&registry()).unwrap();

        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action().command().name(), "create_order");
        assert_eq!(steps[1].action().timeout(), Some(Duration::from_secs(30)));
        assert!(steps.iter().all(|s| s.action().state() == ActionState::Initial));
    }

    #[test]
    fn test_instantiate_rejects_unregistered_command() {
        let result = configuration().instantiate(&CommandRegistry::new());
        assert!(matches!(result, Err(SagaError::UnknownCommand(_))));
    }

    #[test]
    fn test_from_steps_roundtrip() {
        let configuration = configuration();
        let steps = configuration.instantiate(&registry()).unwrap();

        let derived = SagaConfiguration::from_steps("CreateOrder", &steps);
        assert_eq!(derived.steps, configuration.steps);
    }

    #[tokio::test]
    async fn test_repository_lifecycle() {
        let repository = SagaConfigurationRepository::new(Arc::new(InMemorySagaStore::new()));

        let stored = repository.add(configuration()).await.unwrap();
        assert!(stored.etag.is_some());

        let mut loaded = repository.require(stored.id).await.unwrap();
        assert_eq!(loaded, stored);

        loaded.name = "CreateOrderV2".to_string();
        let updated = repository.update(loaded).await.unwrap();
        assert_ne!(updated.etag, stored.etag);

        // The first etag is stale now.
        let stale = repository.update(stored.clone()).await;
        assert!(stale.unwrap_err().is_concurrency_conflict());

        repository.remove(stored.id).await.unwrap();
        let missing = repository.require(stored.id).await;
        assert!(matches!(missing, Err(SagaError::ConfigurationMissing(id)) if id == stored.id));
    }
}
