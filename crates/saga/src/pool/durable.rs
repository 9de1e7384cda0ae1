use std::sync::{Arc, Weak};

use async_trait::async_trait;
use common::SagaId;
use tokio::sync::Mutex;

use super::{SagaPool, attach_entity, bind_dispatchers};
use crate::dispatcher::ResultDispatcher;
use crate::error::Result;
use crate::factory::{EntityRehydrator, SagaFactory};
use crate::repository::SagaRepository;
use crate::saga::SharedSaga;

/// Saga pool backed by a [`SagaRepository`].
///
/// Holds no instances of its own: every `get_saga` reconstitutes the saga
/// from its current record, or from its latest snapshot if the record is
/// missing, so any process sharing the store can push a saga forward. A
/// removed saga is never restored. Writes are guarded by the record's etag;
/// a stale instance fails to persist with a concurrency conflict.
pub struct DurableSagaPool {
    factory: SagaFactory,
    repository: Arc<SagaRepository>,
    result_dispatchers: Vec<Arc<ResultDispatcher>>,
    self_ref: Weak<DurableSagaPool>,
}

impl DurableSagaPool {
    /// Creates a pool persisting through `repository`. Sagas built by
    /// `factory` are wired to the same repository.
    pub fn new(
        factory: SagaFactory,
        repository: Arc<SagaRepository>,
        result_dispatchers: Vec<Arc<ResultDispatcher>>,
    ) -> Arc<Self> {
        let factory = factory.with_repository(repository.clone());
        Arc::new_cyclic(|self_ref| Self {
            factory,
            repository,
            result_dispatchers,
            self_ref: self_ref.clone(),
        })
    }

    pub fn repository(&self) -> &Arc<SagaRepository> {
        &self.repository
    }

    fn weak(&self) -> Weak<dyn SagaPool> {
        self.self_ref.clone()
    }
}

#[async_trait]
impl SagaPool for DurableSagaPool {
    #[tracing::instrument(skip(self))]
    async fn create_saga(&self, saga_type: &str) -> Result<SharedSaga> {
        let mut saga = self.factory.create(saga_type).await?;
        let etag = self.repository.create(&saga).await?;
        saga.set_etag(Some(etag));

        bind_dispatchers(&self.result_dispatchers, saga_type, &self.weak()).await;
        Ok(Arc::new(Mutex::new(saga)))
    }

    #[tracing::instrument(skip(self, rehydrator))]
    async fn get_saga(
        &self,
        saga_id: SagaId,
        rehydrator: Option<&dyn EntityRehydrator>,
    ) -> Result<Option<SharedSaga>> {
        let mut saga = match self.repository.get(saga_id).await? {
            Some((record, etag)) => self.factory.rehydrate(record, etag)?,
            None if self.repository.is_removed(saga_id).await? => return Ok(None),
            None => match self.repository.latest_snapshot(saga_id).await? {
                Some(snapshot) => {
                    tracing::debug!(sequence = %snapshot.sequence, "restoring saga from snapshot");
                    self.factory.restore_from_snapshot(snapshot).await?
                }
                None => return Ok(None),
            },
        };

        attach_entity(&mut saga, rehydrator).await?;
        bind_dispatchers(&self.result_dispatchers, saga.saga_type(), &self.weak()).await;
        Ok(Some(Arc::new(Mutex::new(saga))))
    }

    /// Writes the record of a saga that has none yet, such as one restored
    /// from a snapshot. Sagas with an etag already wrote their record on
    /// their last transition.
    async fn replace_saga(&self, saga: SharedSaga) -> Result<()> {
        let mut saga = saga.lock().await;
        if saga.etag().is_none() {
            let etag = self.repository.save(&saga).await?;
            saga.set_etag(Some(etag));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove_saga(&self, saga_id: SagaId) -> Result<()> {
        self.repository.remove(saga_id).await
    }
}

impl std::fmt::Debug for DurableSagaPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableSagaPool")
            .field("factory", &self.factory)
            .field("repository", &self.repository)
            .finish_non_exhaustive()
    }
}
