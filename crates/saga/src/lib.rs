//! Saga orchestration engine.
//!
//! A saga runs a sequence of remote operations owned by independent
//! services as one logical transaction. Each step pairs a forward action
//! with a compensating action; when a forward action fails, completed
//! steps are compensated in reverse order, starting with the step that
//! failed.
//!
//! The engine decouples what to execute from who executes it:
//! 1. A saga dispatches the current action's command through the
//!    [`CommandDispatcher`] to the handler registered for its name.
//! 2. The handler performs the side effect and later reports the result
//!    through a [`ResultDispatcher`], which finds the saga in its pool.
//! 3. A [`ResultEvaluator`] compares the result with the expected one and
//!    the state machine advances, compensates or finishes.
//!
//! Every dispatch appends a snapshot to the saga's history; every
//! transition writes the saga's current record.

pub mod action;
pub mod command;
pub mod config;
pub mod configuration;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod factory;
pub mod handlers;
pub mod lock;
pub mod pool;
pub mod repository;
pub mod saga;
pub mod snapshot;
pub mod state;

pub use action::{SagaAction, SagaStep};
pub use command::{Command, CommandRegistry, CommandTemplate, ResultKind, ResultValue};
pub use config::SagaEngineConfig;
pub use configuration::{
    ActionTemplate, SagaConfiguration, SagaConfigurationRepository, StepTemplate,
};
pub use dispatcher::{
    CommandDispatcher, CommandHandler, DispatchError, HandlerError, ResultDispatcher,
    ResultDispatchingHandler,
};
pub use error::{Result, SagaError};
pub use evaluator::{
    EqualityEvaluator, EvaluationError, EvaluatorRegistry, FnEvaluator, ResultEvaluator,
};
pub use factory::{EntityRehydrator, SagaDefinition, SagaFactory};
pub use handlers::{
    InMemoryEntityRehydrator, InMemoryLockHandler, RecordingCommandHandler,
    ReplyingCommandHandler,
};
pub use lock::{LockError, LockHandler};
pub use pool::{DurableSagaPool, InMemorySagaPool, SagaPool};
pub use repository::SagaRepository;
pub use saga::{Saga, SagaBindings, SharedSaga};
pub use snapshot::{SagaRecord, SagaSnapshot, SnapshotStep};
pub use state::{ActionState, SagaState};

pub use tokio_util::sync::CancellationToken;
