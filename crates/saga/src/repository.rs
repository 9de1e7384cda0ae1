//! Saga persistence over a [`SagaStore`].
//!
//! Each persisted transition writes the saga's current record, guarded by
//! its etag. Dispatches additionally append a pruned snapshot to the saga's
//! history. Writes for one saga id are serialized through a per-id lock that
//! is acquired with a timeout.

use std::sync::Arc;
use std::time::Duration;

use common::{ETag, SagaId};
use dashmap::DashMap;
use saga_store::{
    InMemorySagaStore, PostgresSagaStore, SagaDocument, SagaStore, SagaStoreExt, SnapshotEnvelope,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::SagaEngineConfig;
use crate::error::{Result, SagaError};
use crate::saga::Saga;
use crate::snapshot::{SagaRecord, SagaSnapshot};

/// Loads and persists sagas.
pub struct SagaRepository {
    store: Arc<dyn SagaStore>,
    locks: DashMap<SagaId, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

impl SagaRepository {
    /// Creates a repository using the engine's lock timeout.
    pub fn new(store: Arc<dyn SagaStore>, config: &SagaEngineConfig) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            lock_timeout: config.lock_timeout,
        }
    }

    /// Creates a repository over the store selected by `config`.
    ///
    /// With a database URL, connects to PostgreSQL and runs the migrations;
    /// otherwise falls back to a volatile in-memory store.
    pub async fn connect(config: &SagaEngineConfig) -> Result<Self> {
        let store: Arc<dyn SagaStore> = match &config.database_url {
            Some(url) => {
                let store = PostgresSagaStore::connect(url, config.db_max_connections).await?;
                store.run_migrations().await?;
                tracing::info!(
                    max_connections = config.db_max_connections,
                    "using postgres saga store"
                );
                Arc::new(store)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, sagas are kept in memory only");
                Arc::new(InMemorySagaStore::new())
            }
        };
        Ok(Self::new(store, config))
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Acquires the persistence lock for a saga id.
    ///
    /// Fails with `PersistenceTimeout` if the lock is not obtained within the
    /// configured timeout.
    pub async fn acquire(&self, saga_id: SagaId) -> Result<OwnedMutexGuard<()>> {
        let lock = self
            .locks
            .entry(saga_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::error!(
                    %saga_id,
                    timeout = ?self.lock_timeout,
                    "timed out waiting for saga persistence lock"
                );
                SagaError::PersistenceTimeout {
                    saga_id,
                    timeout_ms: self.lock_timeout.as_millis(),
                }
            })
    }

    /// Writes the current record and appends a pruned snapshot.
    ///
    /// The record's new etag is stored on the saga as soon as the record is
    /// written, so a failed append leaves the saga able to write again.
    /// Returns the new etag.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id(), saga_type = %saga.saga_type()))]
    pub async fn persist(&self, saga: &mut Saga) -> Result<ETag> {
        let _guard = self.acquire(saga.id()).await?;
        let etag = self.write_record(saga).await?;
        saga.set_etag(Some(etag));

        let state = serde_json::to_value(saga.snapshot_record())?;
        let envelope = SnapshotEnvelope::new(saga.id(), saga.saga_type(), Some(etag), state);
        let stored = self.store.append_snapshot(envelope).await?;

        metrics::counter!("saga_snapshots_persisted_total").increment(1);
        tracing::debug!(sequence = %stored.sequence, "saga snapshot appended");
        Ok(etag)
    }

    /// Writes the current record without appending a snapshot.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id(), saga_type = %saga.saga_type()))]
    pub async fn save(&self, saga: &Saga) -> Result<ETag> {
        let _guard = self.acquire(saga.id()).await?;
        self.write_record(saga).await
    }

    /// Stores the record of a saga that has never been persisted.
    pub async fn create(&self, saga: &Saga) -> Result<ETag> {
        let _guard = self.acquire(saga.id()).await?;
        let document = SagaDocument::from_state(saga.id(), saga.saga_type(), &saga.to_record())?;
        let stored = self.store.create_saga(document).await?;
        stored_etag(stored)
    }

    /// Loads the current record of a saga and its etag.
    pub async fn get(&self, saga_id: SagaId) -> Result<Option<(SagaRecord, ETag)>> {
        let Some(document) = self.store.get_saga(saga_id).await? else {
            return Ok(None);
        };
        let etag = stored_etag(document.clone())?;
        Ok(Some((document.into_state()?, etag)))
    }

    /// Loads the snapshot with the highest sequence.
    pub async fn latest_snapshot(&self, saga_id: SagaId) -> Result<Option<SagaSnapshot>> {
        match self.store.latest_snapshot(saga_id).await? {
            Some(envelope) => Ok(Some(SagaSnapshot::try_from(envelope)?)),
            None => Ok(None),
        }
    }

    /// Loads every snapshot of a saga in sequence order.
    pub async fn history(&self, saga_id: SagaId) -> Result<Vec<SagaSnapshot>> {
        self.store
            .snapshots_for_saga(saga_id)
            .await?
            .into_iter()
            .map(|envelope| SagaSnapshot::try_from(envelope).map_err(SagaError::from))
            .collect()
    }

    /// Returns the number of snapshots stored for a saga.
    pub async fn snapshot_count(&self, saga_id: SagaId) -> Result<usize> {
        Ok(self.store.snapshot_count(saga_id).await?)
    }

    /// Returns true if the saga was removed. Its snapshots are kept but it
    /// is no longer restored from them.
    pub async fn is_removed(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.store.is_removed(saga_id).await?)
    }

    /// Removes the saga record. Snapshot history is kept.
    pub async fn remove(&self, saga_id: SagaId) -> Result<()> {
        {
            let _guard = self.acquire(saga_id).await?;
            self.store.remove_saga(saga_id).await?;
        }
        self.locks.remove(&saga_id);
        Ok(())
    }

    async fn write_record(&self, saga: &Saga) -> Result<ETag> {
        let document = SagaDocument::from_state(saga.id(), saga.saga_type(), &saga.to_record())?;
        let stored = self.store.upsert_saga(saga.etag(), document).await?;
        stored_etag(stored)
    }
}

impl std::fmt::Debug for SagaRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRepository")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

fn stored_etag(document: SagaDocument) -> Result<ETag> {
    document.etag.ok_or_else(|| {
        SagaError::Store(saga_store::StoreError::NotFound(format!(
            "etag of saga {}",
            document.saga_id
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{SagaAction, SagaStep};
    use crate::command::Command;
    use crate::saga::SagaBindings;

    fn saga() -> Saga {
        let steps = vec![SagaStep::new(
            1,
            SagaAction::new(Command::new("create_order")),
            SagaAction::new(Command::new("cancel_order")),
        )];
        Saga::new("CreateOrderSaga", steps, SagaBindings::default()).unwrap()
    }

    fn repository(timeout: Duration) -> SagaRepository {
        let config = SagaEngineConfig::default().with_lock_timeout(timeout);
        SagaRepository::new(Arc::new(InMemorySagaStore::new()), &config)
    }

    #[tokio::test]
    async fn test_persist_writes_record_and_snapshot() {
        let repository = repository(Duration::from_secs(1));
        let mut saga = saga();

        let etag = repository.persist(&mut saga).await.unwrap();
        assert_eq!(saga.etag(), Some(etag));

        let (record, stored_etag) = repository.get(saga.id()).await.unwrap().unwrap();
        assert_eq!(stored_etag, etag);
        assert_eq!(record.saga_type, "CreateOrderSaga");
        assert_eq!(repository.snapshot_count(saga.id()).await.unwrap(), 1);

        let snapshot = repository.latest_snapshot(saga.id()).await.unwrap().unwrap();
        assert_eq!(snapshot.etag, Some(etag));
        assert!(snapshot.record.steps.is_empty());
    }

    #[tokio::test]
    async fn test_save_rejects_stale_etag() {
        let repository = repository(Duration::from_secs(1));
        let mut saga = saga();

        let first = repository.save(&saga).await.unwrap();
        saga.set_etag(Some(first));
        repository.save(&saga).await.unwrap();

        // Still carries the first etag.
        let result = repository.save(&saga).await;
        assert!(result.unwrap_err().is_concurrency_conflict());
    }

    #[tokio::test]
    async fn test_persist_times_out_while_locked() {
        let repository = repository(Duration::from_millis(20));
        let mut saga = saga();

        let _held = repository.acquire(saga.id()).await.unwrap();
        let result = repository.persist(&mut saga).await;

        assert!(matches!(
            result,
            Err(SagaError::PersistenceTimeout { saga_id, .. }) if saga_id == saga.id()
        ));
        assert_eq!(repository.snapshot_count(saga.id()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_keeps_history() {
        let repository = repository(Duration::from_secs(1));
        let mut saga = saga();
        repository.persist(&mut saga).await.unwrap();

        repository.remove(saga.id()).await.unwrap();

        assert!(repository.get(saga.id()).await.unwrap().is_none());
        assert!(repository.is_removed(saga.id()).await.unwrap());
        assert_eq!(repository.history(saga.id()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_database_url() {
        let config = SagaEngineConfig::default().with_lock_timeout(Duration::from_millis(250));
        let repository = SagaRepository::connect(&config).await.unwrap();
        let mut saga = saga();

        repository.persist(&mut saga).await.unwrap();

        assert_eq!(repository.lock_timeout(), Duration::from_millis(250));
        assert_eq!(repository.snapshot_count(saga.id()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let repository = repository(Duration::from_secs(1));
        let saga = saga();

        let etag = repository.create(&saga).await.unwrap();
        let (record, stored) = repository.get(saga.id()).await.unwrap().unwrap();

        assert_eq!(stored, etag);
        assert_eq!(record, saga.to_record());
    }
}
