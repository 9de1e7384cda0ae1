//! Saga steps and their forward/compensating actions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActionId, AggregateId, SagaId};
use serde::{Deserialize, Serialize};

use crate::command::{Command, ResultValue};
use crate::state::ActionState;

/// One command executed as part of a saga step, forward or compensating.
///
/// Only the owning saga mutates the runtime fields, once per dispatch and
/// once per result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaAction {
    id: ActionId,
    command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout: Option<Duration>,
    reverse_on_failure: bool,
    state: ActionState,
    state_info: Option<String>,
    started: Option<DateTime<Utc>>,
    completed: Option<DateTime<Utc>>,
}

impl SagaAction {
    /// Creates an action for a command, with no timeout.
    pub fn new(command: Command) -> Self {
        Self {
            id: ActionId::new(),
            command,
            timeout: None,
            reverse_on_failure: true,
            state: ActionState::Initial,
            state_info: None,
            started: None,
            completed: None,
        }
    }

    /// Declares how long the action may take before a matching result is
    /// downgraded to a timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets whether this step is compensated when the saga rolls back.
    pub fn with_reverse_on_failure(mut self, reverse_on_failure: bool) -> Self {
        self.reverse_on_failure = reverse_on_failure;
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn reverse_on_failure(&self) -> bool {
        self.reverse_on_failure
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    /// Returns the explanation recorded with the last outcome.
    pub fn state_info(&self) -> Option<&str> {
        self.state_info.as_deref()
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.started
    }

    pub fn completed(&self) -> Option<DateTime<Utc>> {
        self.completed
    }

    /// Elapsed time between dispatch and result, or until now while running.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let started = self.started?;
        Some(self.completed.unwrap_or_else(Utc::now) - started)
    }

    /// Returns true if the action's elapsed time exceeds its declared timeout.
    pub fn exceeded_timeout(&self) -> bool {
        match (self.timeout, self.duration()) {
            (Some(timeout), Some(elapsed)) => chrono::Duration::from_std(timeout)
                .map(|limit| elapsed > limit)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) fn begin(&mut self, saga_id: SagaId, entity_id: Option<AggregateId>) {
        self.command.bind(saga_id, entity_id);
        self.state = ActionState::Running;
        self.state_info = None;
        self.started = Some(Utc::now());
        self.completed = None;
    }

    pub(crate) fn record_result(&mut self, result: ResultValue) {
        self.command.set_result(result);
        self.completed = Some(Utc::now());
    }

    /// Returns a never-run copy of this action with a fresh id.
    ///
    /// The owning saga assigns the final id through [`SagaStep::assign_ids`].
    pub(crate) fn renewed(&self) -> Self {
        Self {
            timeout: self.timeout,
            reverse_on_failure: self.reverse_on_failure,
            ..Self::new(self.command.unbound())
        }
    }

    pub(crate) fn finish(&mut self, state: ActionState, state_info: Option<String>) {
        self.state = state;
        self.state_info = state_info;
        if self.completed.is_none() {
            self.completed = Some(Utc::now());
        }
    }
}

/// A saga step: a forward action and the compensating action that undoes it.
///
/// Steps are immutable in shape once the saga starts; only the actions'
/// runtime fields change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    sequence: u32,
    action: SagaAction,
    compensating_action: SagaAction,
}

impl SagaStep {
    /// Creates a step. Sequences are 1-based and contiguous within a saga.
    pub fn new(sequence: u32, action: SagaAction, compensating_action: SagaAction) -> Self {
        Self {
            sequence,
            action,
            compensating_action,
        }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn action(&self) -> &SagaAction {
        &self.action
    }

    pub fn compensating_action(&self) -> &SagaAction {
        &self.compensating_action
    }

    /// Returns the forward or compensating action.
    pub fn action_for(&self, compensating: bool) -> &SagaAction {
        if compensating {
            &self.compensating_action
        } else {
            &self.action
        }
    }

    pub(crate) fn action_for_mut(&mut self, compensating: bool) -> &mut SagaAction {
        if compensating {
            &mut self.compensating_action
        } else {
            &mut self.action
        }
    }

    pub(crate) fn replace_action(&mut self, compensating: bool, action: SagaAction) {
        *self.action_for_mut(compensating) = action;
    }

    /// Returns a never-run copy of this step with fresh action ids.
    pub(crate) fn renewed(&self) -> Self {
        Self {
            sequence: self.sequence,
            action: self.action.renewed(),
            compensating_action: self.compensating_action.renewed(),
        }
    }

    /// Gives both actions the ids derived from `saga_id` and the sequence.
    pub(crate) fn assign_ids(&mut self, saga_id: SagaId) {
        self.action.id = ActionId::for_step(saga_id, self.sequence, false);
        self.compensating_action.id = ActionId::for_step(saga_id, self.sequence, true);
    }
}

/// Checks that step sequences are exactly `1..=n`.
pub(crate) fn validate_sequences(steps: &[SagaStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("a saga needs at least one step".to_string());
    }

    let mut sequences: Vec<u32> = steps.iter().map(SagaStep::sequence).collect();
    sequences.sort_unstable();
    for (index, sequence) in sequences.iter().enumerate() {
        let expected = index as u32 + 1;
        if *sequence != expected {
            return Err(format!(
                "step sequences must be contiguous from 1, found {sequence} where {expected} was expected"
            ));
        }
    }
    Ok(())
}
