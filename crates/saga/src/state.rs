//! Saga and action state machines.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Initial ──► Executing ──┬──► Executed
///                         └──► Compensating ──► Compensated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// Saga has not started yet.
    #[default]
    Initial,

    /// Forward actions are being executed.
    Executing,

    /// All forward actions succeeded (terminal state).
    Executed,

    /// A forward action failed and compensating actions are running.
    Compensating,

    /// Compensation finished after a failure (terminal state).
    Compensated,
}

impl SagaState {
    /// Returns true if the saga can be started.
    pub fn can_start(&self) -> bool {
        matches!(self, SagaState::Initial)
    }

    /// Returns true if the saga is waiting for an action result.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SagaState::Executing | SagaState::Compensating)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaState::Executed | SagaState::Compensated)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Initial => "Initial",
            SagaState::Executing => "Executing",
            SagaState::Executed => "Executed",
            SagaState::Compensating => "Compensating",
            SagaState::Compensated => "Compensated",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The state of a single forward or compensating action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActionState {
    /// The action has not been dispatched.
    #[default]
    Initial,

    /// The action's command was dispatched and its result is pending.
    Running,

    /// The result matched the expected result within the timeout.
    Succeeded,

    /// The result did not match, or the command could not be dispatched.
    Failed,

    /// The result matched but arrived after the action's timeout.
    TimedOut,

    /// Cancellation was requested before the result was evaluated.
    Cancelled,
}

impl ActionState {
    /// Returns true once the action has a final outcome.
    pub fn is_finished(&self) -> bool {
        !matches!(self, ActionState::Initial | ActionState::Running)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Initial => "Initial",
            ActionState::Running => "Running",
            ActionState::Succeeded => "Succeeded",
            ActionState::Failed => "Failed",
            ActionState::TimedOut => "TimedOut",
            ActionState::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
