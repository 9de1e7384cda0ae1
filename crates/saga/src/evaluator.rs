//! Result evaluators: decide whether an action's actual result is a success.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::action::SagaAction;
use crate::command::{ResultKind, ResultValue};

/// An evaluator could not decide.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EvaluationError {
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Compares an actual result with the expected one.
///
/// An evaluator handles one result kind and may be scoped to one saga type;
/// unscoped evaluators apply to every saga.
#[async_trait]
pub trait ResultEvaluator: Send + Sync {
    /// The saga type this evaluator is restricted to, if any.
    fn saga_type(&self) -> Option<&str> {
        None
    }

    /// The result kind this evaluator compares.
    fn result_kind(&self) -> ResultKind;

    /// Returns true if `actual` satisfies `expected`.
    async fn evaluate(
        &self,
        actual: &ResultValue,
        expected: &ResultValue,
    ) -> Result<bool, EvaluationError>;
}

/// Succeeds when the actual result equals the expected result.
#[derive(Debug, Clone)]
pub struct EqualityEvaluator {
    kind: ResultKind,
    saga_type: Option<String>,
}

impl EqualityEvaluator {
    /// Creates an unscoped equality evaluator for `kind`.
    pub fn new(kind: ResultKind) -> Self {
        Self {
            kind,
            saga_type: None,
        }
    }

    /// Restricts the evaluator to one saga type.
    pub fn scoped(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }
}

#[async_trait]
impl ResultEvaluator for EqualityEvaluator {
    fn saga_type(&self) -> Option<&str> {
        self.saga_type.as_deref()
    }

    fn result_kind(&self) -> ResultKind {
        self.kind
    }

    async fn evaluate(
        &self,
        actual: &ResultValue,
        expected: &ResultValue,
    ) -> Result<bool, EvaluationError> {
        if actual.kind() != self.kind {
            return Err(EvaluationError::new(format!(
                "Expected a {} result, got {}.",
                self.kind,
                actual.kind()
            )));
        }
        Ok(actual == expected)
    }
}

type Predicate =
    dyn Fn(&ResultValue, &ResultValue) -> Result<bool, EvaluationError> + Send + Sync;

/// Evaluates results with a closure, e.g. "at least the expected quantity".
#[derive(Clone)]
pub struct FnEvaluator {
    kind: ResultKind,
    saga_type: Option<String>,
    predicate: Arc<Predicate>,
}

impl FnEvaluator {
    pub fn new<F>(kind: ResultKind, predicate: F) -> Self
    where
        F: Fn(&ResultValue, &ResultValue) -> Result<bool, EvaluationError> + Send + Sync + 'static,
    {
        Self {
            kind,
            saga_type: None,
            predicate: Arc::new(predicate),
        }
    }

    /// Restricts the evaluator to one saga type.
    pub fn scoped(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }
}

#[async_trait]
impl ResultEvaluator for FnEvaluator {
    fn saga_type(&self) -> Option<&str> {
        self.saga_type.as_deref()
    }

    fn result_kind(&self) -> ResultKind {
        self.kind
    }

    async fn evaluate(
        &self,
        actual: &ResultValue,
        expected: &ResultValue,
    ) -> Result<bool, EvaluationError> {
        (self.predicate)(actual, expected)
    }
}

/// Ordered collection of evaluators keyed by saga type and result kind.
#[derive(Clone, Default)]
pub struct EvaluatorRegistry {
    evaluators: Vec<Arc<dyn ResultEvaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers unscoped equality evaluators for every result kind.
    pub fn with_defaults() -> Self {
        [
            ResultKind::Unit,
            ResultKind::Boolean,
            ResultKind::Integer,
            ResultKind::Decimal,
            ResultKind::Text,
            ResultKind::Id,
            ResultKind::Json,
        ]
        .into_iter()
        .fold(Self::new(), |registry, kind| {
            registry.register(EqualityEvaluator::new(kind))
        })
    }

    /// Appends an evaluator. Earlier registrations win on selection.
    pub fn register(mut self, evaluator: impl ResultEvaluator + 'static) -> Self {
        self.evaluators.push(Arc::new(evaluator));
        self
    }

    /// Inserts an evaluator ahead of all existing ones.
    pub fn register_first(mut self, evaluator: impl ResultEvaluator + 'static) -> Self {
        self.evaluators.insert(0, Arc::new(evaluator));
        self
    }

    /// Returns the evaluators applicable to a saga type, in registration order.
    pub fn for_saga_type(&self, saga_type: &str) -> Self {
        Self {
            evaluators: self
                .evaluators
                .iter()
                .filter(|e| e.saga_type().is_none_or(|t| t == saga_type))
                .cloned()
                .collect(),
        }
    }

    /// Selects the first evaluator matching the saga type and result kind.
    pub fn select(&self, saga_type: &str, kind: ResultKind) -> Option<&Arc<dyn ResultEvaluator>> {
        self.evaluators.iter().find(|e| {
            e.result_kind() == kind && e.saga_type().is_none_or(|t| t == saga_type)
        })
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }
}

/// The evaluated outcome of an action result.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActionOutcome {
    Succeeded,
    Failed(String),
    TimedOut(String),
    Cancelled,
}

/// Evaluates the result recorded on `action`.
///
/// Cancellation is honoured for forward actions only. A matching result that
/// arrives after the action's timeout becomes a timeout failure.
pub(crate) async fn evaluate_action(
    evaluators: &EvaluatorRegistry,
    saga_type: &str,
    action: &SagaAction,
    compensating: bool,
    cancellation_requested: bool,
) -> ActionOutcome {
    if cancellation_requested && !compensating {
        return ActionOutcome::Cancelled;
    }

    let command = action.command();
    let matched = match (command.result(), command.expected_result()) {
        (_, None) => true,
        (None, Some(_)) => return ActionOutcome::Failed("No result was reported.".to_string()),
        (Some(actual), Some(expected)) => {
            let Some(evaluator) = evaluators.select(saga_type, expected.kind()) else {
                return ActionOutcome::Failed(format!(
                    "No evaluator registered for {} results.",
                    expected.kind()
                ));
            };
            match evaluator.evaluate(actual, expected).await {
                Ok(true) => true,
                Ok(false) => {
                    return ActionOutcome::Failed(format!(
                        "Unexpected result '{actual}', expected '{expected}'."
                    ));
                }
                Err(e) => return ActionOutcome::Failed(format!("Evaluation failed: {e}")),
            }
        }
    };

    if matched && action.exceeded_timeout() {
        let elapsed = action
            .duration()
            .map(|d| d.num_milliseconds())
            .unwrap_or_default();
        let limit = action.timeout().map(|t| t.as_millis()).unwrap_or_default();
        return ActionOutcome::TimedOut(format!(
            "Timed out after {elapsed}ms, limit was {limit}ms."
        ));
    }

    ActionOutcome::Succeeded
}
