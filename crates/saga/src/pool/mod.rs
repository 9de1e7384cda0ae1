//! Saga instance lifecycle.
//!
//! A pool creates sagas through the factory, hands out instances by id and
//! takes back changed ones. Before handing out an instance it binds every
//! result dispatcher serving the saga's type to itself, so results reported
//! later find the instance again.

mod durable;
mod memory;

pub use durable::DurableSagaPool;
pub use memory::InMemorySagaPool;

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use common::SagaId;

use crate::dispatcher::ResultDispatcher;
use crate::error::Result;
use crate::factory::EntityRehydrator;
use crate::saga::{Saga, SharedSaga};

/// Owns saga instances.
#[async_trait]
pub trait SagaPool: Send + Sync {
    /// Creates a new `Initial` saga of `saga_type`.
    async fn create_saga(&self, saga_type: &str) -> Result<SharedSaga>;

    /// Returns the saga with the given id, or None if the pool does not know it.
    ///
    /// With a rehydrator, the live business entity is attached to the saga.
    async fn get_saga(
        &self,
        saga_id: SagaId,
        rehydrator: Option<&dyn EntityRehydrator>,
    ) -> Result<Option<SharedSaga>>;

    /// Takes back a saga after it changed.
    async fn replace_saga(&self, saga: SharedSaga) -> Result<()>;

    /// Forgets a saga.
    async fn remove_saga(&self, saga_id: SagaId) -> Result<()>;
}

/// Binds the dispatchers serving `saga_type` to `pool`.
async fn bind_dispatchers(
    dispatchers: &[Arc<ResultDispatcher>],
    saga_type: &str,
    pool: &Weak<dyn SagaPool>,
) {
    for dispatcher in dispatchers.iter().filter(|d| d.applies_to(saga_type)) {
        dispatcher.bind(pool.clone()).await;
    }
}

/// Attaches the live entity to a loaded saga.
async fn attach_entity(saga: &mut Saga, rehydrator: Option<&dyn EntityRehydrator>) -> Result<()> {
    if let (Some(rehydrator), Some(entity_id)) = (rehydrator, saga.entity_id()) {
        let entity = rehydrator.rehydrate(entity_id).await?;
        saga.attach_entity(entity);
    }
    Ok(())
}
