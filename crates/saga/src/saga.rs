//! The saga state machine.
//!
//! A saga walks its steps forward, one dispatched action at a time, and is
//! pushed along only by results reported for the running action. A failed
//! forward action turns the saga around: compensating actions then run from
//! the failed step back to the first. A failed compensating action stalls the
//! saga in `Compensating` until an operator intervenes.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{AggregateId, ConfigurationId, ETag, SagaId};
use tokio_util::sync::CancellationToken;

use crate::action::{SagaStep, validate_sequences};
use crate::command::ResultValue;
use crate::dispatcher::CommandDispatcher;
use crate::error::{Result, SagaError};
use crate::evaluator::{ActionOutcome, EvaluatorRegistry, evaluate_action};
use crate::lock::LockHandler;
use crate::repository::SagaRepository;
use crate::snapshot::{RecordHeader, SagaRecord};
use crate::state::{ActionState, SagaState};

/// A saga shared between its pool and the parties reporting results.
pub type SharedSaga = Arc<tokio::sync::Mutex<Saga>>;

/// The collaborators a saga is wired to by its factory.
#[derive(Clone, Default)]
pub struct SagaBindings {
    pub dispatcher: Arc<CommandDispatcher>,
    pub evaluators: EvaluatorRegistry,
    pub lock_handler: Option<Arc<dyn LockHandler>>,
    pub repository: Option<Arc<SagaRepository>>,
}

/// What the state machine does after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Dispatch,
    Finished,
    Stalled,
}

/// A running saga instance.
pub struct Saga {
    id: SagaId,
    saga_type: String,
    started: Option<DateTime<Utc>>,
    entity_id: Option<AggregateId>,
    current_step: u32,
    state: SagaState,
    state_info: Option<String>,
    etag: Option<ETag>,
    config_id: Option<ConfigurationId>,
    config_name: Option<String>,
    steps: Vec<SagaStep>,
    override_lock_check: bool,
    bindings: SagaBindings,
    cancellation: CancellationToken,
    entity: Option<Arc<dyn Any + Send + Sync>>,
}

impl Saga {
    /// Creates a saga in the `Initial` state with a fresh id.
    ///
    /// Step sequences must be contiguous from 1. Action ids are derived from
    /// the saga id and the step sequence.
    pub fn new(
        saga_type: impl Into<String>,
        mut steps: Vec<SagaStep>,
        bindings: SagaBindings,
    ) -> Result<Self> {
        validate_sequences(&steps).map_err(SagaError::InvalidSteps)?;
        steps.sort_by_key(SagaStep::sequence);

        let id = SagaId::new();
        for step in &mut steps {
            step.assign_ids(id);
        }

        Ok(Self {
            id,
            saga_type: saga_type.into(),
            started: None,
            entity_id: None,
            current_step: 0,
            state: SagaState::Initial,
            state_info: None,
            etag: None,
            config_id: None,
            config_name: None,
            steps,
            override_lock_check: false,
            bindings,
            cancellation: CancellationToken::new(),
            entity: None,
        })
    }

    /// Reconstitutes a saga from a persisted record and its step list.
    pub(crate) fn from_record(
        record: SagaRecord,
        mut steps: Vec<SagaStep>,
        etag: Option<ETag>,
        bindings: SagaBindings,
    ) -> Result<Self> {
        validate_sequences(&steps).map_err(SagaError::InvalidSteps)?;
        steps.sort_by_key(SagaStep::sequence);

        Ok(Self {
            id: record.saga_id,
            saga_type: record.saga_type,
            started: record.saga_started,
            entity_id: record.entity_id,
            current_step: record.current_step,
            state: record.state,
            state_info: record.state_info,
            etag,
            config_id: record.config_id,
            config_name: record.config_name,
            steps,
            override_lock_check: false,
            bindings,
            cancellation: CancellationToken::new(),
            entity: None,
        })
    }

    /// Records the configuration the steps were instantiated from.
    pub(crate) fn with_configuration(
        mut self,
        config_id: ConfigurationId,
        config_name: impl Into<String>,
    ) -> Self {
        self.config_id = Some(config_id);
        self.config_name = Some(config_name.into());
        self
    }

    /// Skips the lock check on start.
    pub fn set_override_lock_check(&mut self, override_lock_check: bool) {
        self.override_lock_check = override_lock_check;
    }

    pub fn id(&self) -> SagaId {
        self.id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn entity_id(&self) -> Option<AggregateId> {
        self.entity_id
    }

    /// Returns the sequence of the step being executed or compensated.
    /// Zero before the saga starts.
    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Returns the explanation of the last failure, if any.
    pub fn state_info(&self) -> Option<&str> {
        self.state_info.as_deref()
    }

    /// Returns the concurrency token of the last persisted record.
    pub fn etag(&self) -> Option<ETag> {
        self.etag
    }

    pub(crate) fn set_etag(&mut self, etag: Option<ETag>) {
        self.etag = etag;
    }

    pub fn config_id(&self) -> Option<ConfigurationId> {
        self.config_id
    }

    pub fn config_name(&self) -> Option<&str> {
        self.config_name.as_deref()
    }

    pub fn override_lock_check(&self) -> bool {
        self.override_lock_check
    }

    /// Returns the steps in sequence order.
    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    /// Returns the step with the given sequence.
    pub fn step(&self, sequence: u32) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.sequence() == sequence)
    }

    /// Returns the token polled when forward results are evaluated.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true if a compensating action failed and the saga can no
    /// longer move on its own.
    pub fn is_stalled(&self) -> bool {
        self.state == SagaState::Compensating
            && self.step(self.current_step).is_some_and(|step| {
                let state = step.compensating_action().state();
                state.is_finished() && state != ActionState::Succeeded
            })
    }

    /// Returns the live business entity attached on load, if any.
    pub fn entity(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.entity.as_ref()
    }

    /// Returns the attached entity downcast to a concrete type.
    pub fn entity_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.entity.clone()?.downcast::<T>().ok()
    }

    pub(crate) fn attach_entity(&mut self, entity: Option<Arc<dyn Any + Send + Sync>>) {
        self.entity = entity;
    }

    /// Returns the full persisted form of this saga.
    pub fn to_record(&self) -> SagaRecord {
        SagaRecord::full(self.header(), &self.steps)
    }

    /// Returns the snapshot form, without actions that never ran.
    pub fn snapshot_record(&self) -> SagaRecord {
        SagaRecord::pruned(self.header(), &self.steps)
    }

    fn header(&self) -> RecordHeader {
        RecordHeader {
            saga_id: self.id,
            saga_type: self.saga_type.clone(),
            entity_id: self.entity_id,
            saga_started: self.started,
            current_step: self.current_step,
            state: self.state,
            state_info: self.state_info.clone(),
            config_id: self.config_id,
            config_name: self.config_name.clone(),
        }
    }

    fn min_sequence(&self) -> u32 {
        self.steps.first().map(SagaStep::sequence).unwrap_or_default()
    }

    fn max_sequence(&self) -> u32 {
        self.steps.last().map(SagaStep::sequence).unwrap_or_default()
    }

    fn current_index(&self) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.sequence() == self.current_step)
            .ok_or_else(|| {
                SagaError::InvalidSteps(format!(
                    "saga {} has no step {}",
                    self.id, self.current_step
                ))
            })
    }

    /// Starts the saga for a business entity and dispatches the first action.
    ///
    /// Fails with `Locked` if the lock handler reports the entity as owned by
    /// another in-flight saga, unless the lock check is overridden. Nothing is
    /// dispatched or persisted in that case.
    #[tracing::instrument(skip(self, cancellation), fields(saga_id = %self.id, saga_type = %self.saga_type))]
    pub async fn start(
        &mut self,
        entity_id: AggregateId,
        cancellation: CancellationToken,
    ) -> Result<()> {
        if !self.state.can_start() {
            return Err(SagaError::InvalidState {
                expected: SagaState::Initial.to_string(),
                actual: self.state,
            });
        }

        if !self.override_lock_check
            && let Some(lock_handler) = &self.bindings.lock_handler
        {
            let locked = lock_handler
                .is_locked(entity_id)
                .await
                .map_err(|e| SagaError::LockCheck(e.message))?;
            if locked {
                metrics::counter!("saga_lock_conflicts_total").increment(1);
                tracing::warn!(%entity_id, "entity is locked by another saga");
                return Err(SagaError::Locked {
                    saga_type: self.saga_type.clone(),
                    entity_id,
                });
            }
        }

        self.entity_id = Some(entity_id);
        self.cancellation = cancellation;
        self.state = SagaState::Executing;
        self.state_info = None;
        self.current_step = self.min_sequence();
        self.started = Some(Utc::now());

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(%entity_id, steps = self.steps.len(), "saga started");

        self.run(Transition::Dispatch).await
    }

    /// Applies a result reported for the current step's action.
    ///
    /// `compensating` selects the compensating action. A result for an
    /// action that is not running, or that does not match the direction the
    /// saga is moving in, is rejected and causes no transition.
    #[tracing::instrument(
        skip(self, result),
        fields(saga_id = %self.id, saga_type = %self.saga_type, step = self.current_step)
    )]
    pub async fn handle_result(&mut self, result: ResultValue, compensating: bool) -> Result<()> {
        let expected = if compensating {
            SagaState::Compensating
        } else {
            SagaState::Executing
        };
        if self.state != expected {
            return Err(SagaError::InvalidState {
                expected: expected.to_string(),
                actual: self.state,
            });
        }

        let index = self.current_index()?;
        let saga_id = self.id;
        let cancelled = self.cancellation.is_cancelled();

        let action = self.steps[index].action_for_mut(compensating);
        if action.state() != ActionState::Running {
            return Err(SagaError::ActionNotRunning {
                saga_id,
                step: self.current_step,
                state: action.state(),
            });
        }
        action.record_result(result);

        let outcome = evaluate_action(
            &self.bindings.evaluators,
            &self.saga_type,
            action,
            compensating,
            cancelled,
        )
        .await;

        let success = self.apply_outcome(index, compensating, outcome);
        let transition = self.transition_state(success);
        self.run(transition).await
    }

    /// Records an action outcome on the action and, for failures, on the saga.
    fn apply_outcome(&mut self, index: usize, compensating: bool, outcome: ActionOutcome) -> bool {
        let step = &mut self.steps[index];
        let sequence = step.sequence();
        let action = step.action_for_mut(compensating);

        let (state, detail) = match outcome {
            ActionOutcome::Succeeded => {
                action.finish(ActionState::Succeeded, None);
                return true;
            }
            ActionOutcome::Failed(detail) => (ActionState::Failed, detail),
            ActionOutcome::TimedOut(detail) => (ActionState::TimedOut, detail),
            ActionOutcome::Cancelled => {
                (ActionState::Cancelled, "Cancellation requested.".to_string())
            }
        };

        let name = action.command().name().to_string();
        action.finish(state, Some(detail.clone()));
        self.state_info = Some(format!("Step {sequence} command '{name}' failed. {detail}"));
        false
    }

    fn transition_state(&mut self, success: bool) -> Transition {
        match (self.state, success) {
            (SagaState::Executing, true) if self.current_step < self.max_sequence() => {
                self.current_step += 1;
                Transition::Dispatch
            }
            (SagaState::Executing, true) => {
                self.state = SagaState::Executed;
                Transition::Finished
            }
            (SagaState::Executing, false) => {
                tracing::warn!(
                    step = self.current_step,
                    reason = self.state_info.as_deref().unwrap_or_default(),
                    "saga step failed, compensating"
                );
                self.state = SagaState::Compensating;
                Transition::Dispatch
            }
            (SagaState::Compensating, true) if self.current_step > self.min_sequence() => {
                self.current_step -= 1;
                Transition::Dispatch
            }
            (SagaState::Compensating, true) => {
                self.state = SagaState::Compensated;
                Transition::Finished
            }
            (SagaState::Compensating, false) => Transition::Stalled,
            (SagaState::Initial | SagaState::Executed | SagaState::Compensated, _) => {
                Transition::Finished
            }
        }
    }

    /// Drives the saga until an action is awaiting its result or the saga
    /// reaches a terminal or stalled state.
    async fn run(&mut self, mut transition: Transition) -> Result<()> {
        loop {
            match transition {
                Transition::Dispatch => {}
                Transition::Finished => return self.finish().await,
                Transition::Stalled => return self.stall().await,
            }

            let compensating = self.state == SagaState::Compensating;
            let index = self.current_index()?;

            if compensating && !self.steps[index].action().reverse_on_failure() {
                tracing::debug!(step = self.current_step, "step not reversible, skipping compensation");
                transition = self.transition_state(true);
                continue;
            }

            let (saga_id, entity_id) = (self.id, self.entity_id);
            let before = self.steps[index].action_for(compensating).clone();
            let action = self.steps[index].action_for_mut(compensating);
            action.begin(saga_id, entity_id);
            let command = action.command().clone();

            let etag = self.etag;
            if let Err(e) = self.persist_snapshot().await {
                // Nothing was dispatched.
                self.steps[index].replace_action(compensating, before);
                if self.etag != etag {
                    self.restore_record().await;
                }
                return Err(e);
            }

            metrics::counter!("saga_actions_dispatched_total").increment(1);
            tracing::info!(
                step = self.current_step,
                command = command.name(),
                compensating,
                "saga action dispatched"
            );

            match self.bindings.dispatcher.dispatch(command).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let outcome = ActionOutcome::Failed(format!("Dispatch failed: {e}."));
                    let success = self.apply_outcome(index, compensating, outcome);
                    transition = self.transition_state(success);
                }
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        self.save_record().await?;

        if let Some(started) = self.started {
            let elapsed = (Utc::now() - started).num_milliseconds() as f64 / 1000.0;
            metrics::histogram!("saga_duration_seconds").record(elapsed);
        }

        match self.state {
            SagaState::Executed => {
                metrics::counter!("saga_executed_total").increment(1);
                tracing::info!(saga_id = %self.id, "saga executed");
            }
            SagaState::Compensated => {
                metrics::counter!("saga_compensated_total").increment(1);
                tracing::info!(
                    saga_id = %self.id,
                    reason = self.state_info.as_deref().unwrap_or_default(),
                    "saga compensated"
                );
            }
            _ => {}
        }
        Ok(())
    }

    async fn stall(&mut self) -> Result<()> {
        self.save_record().await?;

        metrics::counter!("saga_compensation_stalled_total").increment(1);
        tracing::error!(
            saga_id = %self.id,
            step = self.current_step,
            reason = self.state_info.as_deref().unwrap_or_default(),
            "compensation failed, saga requires operator intervention"
        );
        Ok(())
    }

    async fn persist_snapshot(&mut self) -> Result<()> {
        if let Some(repository) = self.bindings.repository.clone() {
            repository.persist(self).await?;
        }
        Ok(())
    }

    /// Rewrites the record after a dispatch was abandoned, so it does not
    /// show an action running that was never dispatched.
    async fn restore_record(&mut self) {
        if let Err(e) = self.save_record().await {
            tracing::error!(
                saga_id = %self.id,
                step = self.current_step,
                error = %e,
                "failed to restore saga record after abandoned dispatch"
            );
        }
    }

    async fn save_record(&mut self) -> Result<()> {
        if let Some(repository) = self.bindings.repository.clone() {
            self.etag = Some(repository.save(self).await?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("id", &self.id)
            .field("saga_type", &self.saga_type)
            .field("entity_id", &self.entity_id)
            .field("current_step", &self.current_step)
            .field("state", &self.state)
            .field("state_info", &self.state_info)
            .field("etag", &self.etag)
            .field("steps", &self.steps)
            .finish_non_exhaustive()
    }
}
