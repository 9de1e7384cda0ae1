use std::sync::{Arc, Weak};

use async_trait::async_trait;
use common::SagaId;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{SagaPool, attach_entity, bind_dispatchers};
use crate::dispatcher::ResultDispatcher;
use crate::error::Result;
use crate::factory::{EntityRehydrator, SagaFactory};
use crate::saga::SharedSaga;

/// Volatile, single-process saga pool.
///
/// Instances live in a concurrent map keyed by saga id. If the factory has
/// a repository, sagas still write their records and snapshots through it,
/// but the pool never reads them back.
pub struct InMemorySagaPool {
    factory: SagaFactory,
    sagas: DashMap<SagaId, SharedSaga>,
    result_dispatchers: Vec<Arc<ResultDispatcher>>,
    self_ref: Weak<InMemorySagaPool>,
}

impl InMemorySagaPool {
    /// Creates a pool that binds `result_dispatchers` to itself.
    pub fn new(factory: SagaFactory, result_dispatchers: Vec<Arc<ResultDispatcher>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            factory,
            sagas: DashMap::new(),
            result_dispatchers,
            self_ref: self_ref.clone(),
        })
    }

    pub fn factory(&self) -> &SagaFactory {
        &self.factory
    }

    /// Returns the number of sagas in the pool.
    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }

    /// Returns true if the pool holds a saga with the given id.
    pub fn contains(&self, saga_id: SagaId) -> bool {
        self.sagas.contains_key(&saga_id)
    }

    fn weak(&self) -> Weak<dyn SagaPool> {
        self.self_ref.clone()
    }
}

#[async_trait]
impl SagaPool for InMemorySagaPool {
    #[tracing::instrument(skip(self))]
    async fn create_saga(&self, saga_type: &str) -> Result<SharedSaga> {
        let saga = self.factory.create(saga_type).await?;
        let saga_id = saga.id();
        let shared = Arc::new(Mutex::new(saga));

        self.sagas.insert(saga_id, shared.clone());
        bind_dispatchers(&self.result_dispatchers, saga_type, &self.weak()).await;
        Ok(shared)
    }

    async fn get_saga(
        &self,
        saga_id: SagaId,
        rehydrator: Option<&dyn EntityRehydrator>,
    ) -> Result<Option<SharedSaga>> {
        let Some(shared) = self.sagas.get(&saga_id).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        let saga_type = {
            let mut saga = shared.lock().await;
            attach_entity(&mut saga, rehydrator).await?;
            saga.saga_type().to_string()
        };

        bind_dispatchers(&self.result_dispatchers, &saga_type, &self.weak()).await;
        Ok(Some(shared))
    }

    async fn replace_saga(&self, saga: SharedSaga) -> Result<()> {
        let saga_id = saga.lock().await.id();
        self.sagas.insert(saga_id, saga);
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove_saga(&self, saga_id: SagaId) -> Result<()> {
        self.sagas.remove(&saga_id);
        if let Some(repository) = self.factory.repository() {
            repository.remove(saga_id).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemorySagaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySagaPool")
            .field("factory", &self.factory)
            .field("sagas", &self.sagas.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::action::{SagaAction, SagaStep};
    use crate::command::Command;
    use crate::dispatcher::CommandDispatcher;
    use crate::handlers::{InMemoryEntityRehydrator, RecordingCommandHandler};
    use crate::state::SagaState;
    use common::AggregateId;

    const SAGA_TYPE: &str = "CreateOrderSaga";

    fn pool(results: Arc<ResultDispatcher>) -> Arc<InMemorySagaPool> {
        let handler = RecordingCommandHandler::new();
        let dispatcher = CommandDispatcher::new()
            .register("create_order", handler.clone())
            .register("reject_order", handler);
        let factory = SagaFactory::new(dispatcher).with_steps(
            SAGA_TYPE,
            vec![SagaStep::new(
                1,
                SagaAction::new(Command::expecting("create_order", "Pending")),
                SagaAction::new(Command::expecting("reject_order", "Rejected")),
            )],
        );
        InMemorySagaPool::new(factory, vec![results])
    }

    #[tokio::test]
    async fn test_create_binds_dispatcher() {
        let results = Arc::new(ResultDispatcher::scoped(SAGA_TYPE));
        let pool = pool(results.clone());
        assert!(!results.is_bound().await);

        let saga = pool.create_saga(SAGA_TYPE).await.unwrap();

        assert!(results.is_bound().await);
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(saga.lock().await.id()));
    }

    #[tokio::test]
    async fn test_unrelated_dispatcher_stays_unbound() {
        let results = Arc::new(ResultDispatcher::scoped("ShipOrderSaga"));
        let pool = pool(results.clone());

        pool.create_saga(SAGA_TYPE).await.unwrap();
        assert!(!results.is_bound().await);
    }

    #[tokio::test]
    async fn test_result_dispatch_finds_saga() {
        let results = Arc::new(ResultDispatcher::new());
        let pool = pool(results.clone());
        let saga = pool.create_saga(SAGA_TYPE).await.unwrap();
        let saga_id = {
            let mut guard = saga.lock().await;
            guard
                .start(AggregateId::new(), CancellationToken::new())
                .await
                .unwrap();
            guard.id()
        };

        results
            .dispatch_result(saga_id, "Pending".into(), false)
            .await
            .unwrap();

        assert_eq!(saga.lock().await.state(), SagaState::Executed);
    }

    #[tokio::test]
    async fn test_get_attaches_entity() {
        let pool = pool(Arc::new(ResultDispatcher::new()));
        let entity_id = AggregateId::new();
        let rehydrator = InMemoryEntityRehydrator::new();
        rehydrator.insert(entity_id, "order #42".to_string());

        let saga = pool.create_saga(SAGA_TYPE).await.unwrap();
        let saga_id = {
            let mut guard = saga.lock().await;
            guard
                .start(entity_id, CancellationToken::new())
                .await
                .unwrap();
            guard.id()
        };

        let loaded = pool
            .get_saga(saga_id, Some(&rehydrator))
            .await
            .unwrap()
            .unwrap();
        let entity = loaded.lock().await.entity_as::<String>().unwrap();
        assert_eq!(*entity, "order #42");
    }

    #[tokio::test]
    async fn test_remove() {
        let pool = pool(Arc::new(ResultDispatcher::new()));
        let saga = pool.create_saga(SAGA_TYPE).await.unwrap();
        let saga_id = saga.lock().await.id();

        pool.remove_saga(saga_id).await.unwrap();

        assert!(pool.is_empty());
        assert!(pool.get_saga(saga_id, None).await.unwrap().is_none());
    }
}
