use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    ConfigurationDocument, ConfigurationId, ETag, Result, SagaDocument, SagaId, Sequence,
    SnapshotEnvelope, StoreError,
    store::{ConfigurationStore, SagaStore, SnapshotStream},
};

/// In-memory saga store for tests and single-process deployments.
///
/// Provides the same interface and concurrency checks as the PostgreSQL
/// implementation. Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaDocument>>>,
    removed: Arc<RwLock<HashSet<SagaId>>>,
    snapshots: Arc<RwLock<Vec<SnapshotEnvelope>>>,
    configurations: Arc<RwLock<HashMap<ConfigurationId, ConfigurationDocument>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of snapshots stored across all sagas.
    pub async fn total_snapshot_count(&self) -> usize {
        self.snapshots.read().await.len()
    }

    /// Clears all records, snapshots and configurations.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
        self.removed.write().await.clear();
        self.snapshots.write().await.clear();
        self.configurations.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaDocument>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn create_saga(&self, mut document: SagaDocument) -> Result<SagaDocument> {
        let mut sagas = self.sagas.write().await;
        if sagas.contains_key(&document.saga_id) {
            return Err(StoreError::AlreadyExists(document.saga_id.to_string()));
        }

        document.etag = Some(ETag::new());
        document.updated_at = Utc::now();
        sagas.insert(document.saga_id, document.clone());
        Ok(document)
    }

    async fn save_saga(&self, expected: ETag, mut document: SagaDocument) -> Result<SagaDocument> {
        let mut sagas = self.sagas.write().await;
        let current = sagas
            .get(&document.saga_id)
            .ok_or_else(|| StoreError::NotFound(document.saga_id.to_string()))?;

        if current.etag != Some(expected) {
            metrics::counter!("saga_store_concurrency_conflicts_total").increment(1);
            tracing::warn!(saga_id = %document.saga_id, %expected, "saga record changed concurrently");
            return Err(StoreError::ConcurrencyConflict {
                id: document.saga_id.to_string(),
                expected,
                actual: current.etag,
            });
        }

        document.etag = Some(ETag::new());
        document.updated_at = Utc::now();
        sagas.insert(document.saga_id, document.clone());
        Ok(document)
    }

    async fn remove_saga(&self, saga_id: SagaId) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        sagas.remove(&saga_id);
        self.removed.write().await.insert(saga_id);
        Ok(())
    }

    async fn is_removed(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.removed.read().await.contains(&saga_id))
    }

    async fn append_snapshot(&self, mut snapshot: SnapshotEnvelope) -> Result<SnapshotEnvelope> {
        let mut store = self.snapshots.write().await;

        let current = store
            .iter()
            .filter(|s| s.saga_id == snapshot.saga_id)
            .map(|s| s.sequence)
            .max()
            .unwrap_or(Sequence::initial());

        snapshot.sequence = current.next();
        snapshot.timestamp = Utc::now();
        store.push(snapshot.clone());

        Ok(snapshot)
    }

    async fn latest_snapshot(&self, saga_id: SagaId) -> Result<Option<SnapshotEnvelope>> {
        let store = self.snapshots.read().await;
        Ok(store
            .iter()
            .filter(|s| s.saga_id == saga_id)
            .max_by_key(|s| s.sequence)
            .cloned())
    }

    async fn snapshots_for_saga(&self, saga_id: SagaId) -> Result<Vec<SnapshotEnvelope>> {
        let store = self.snapshots.read().await;
        let mut snapshots: Vec<_> = store
            .iter()
            .filter(|s| s.saga_id == saga_id)
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.sequence);
        Ok(snapshots)
    }

    async fn stream_snapshots(&self) -> Result<SnapshotStream> {
        use futures_util::stream;

        let store = self.snapshots.read().await;
        let mut snapshots = store.clone();
        snapshots.sort_by(|a, b| {
            a.saga_id
                .cmp(&b.saga_id)
                .then(a.sequence.cmp(&b.sequence))
        });

        let stream = stream::iter(snapshots.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ConfigurationStore for InMemorySagaStore {
    async fn get_configuration(
        &self,
        id: ConfigurationId,
    ) -> Result<Option<ConfigurationDocument>> {
        Ok(self.configurations.read().await.get(&id).cloned())
    }

    async fn add_configuration(
        &self,
        mut document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument> {
        let mut configurations = self.configurations.write().await;
        if configurations.contains_key(&document.id) {
            return Err(StoreError::AlreadyExists(document.id.to_string()));
        }

        document.etag = Some(ETag::new());
        configurations.insert(document.id, document.clone());
        Ok(document)
    }

    async fn update_configuration(
        &self,
        expected: ETag,
        mut document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument> {
        let mut configurations = self.configurations.write().await;
        let current = configurations
            .get(&document.id)
            .ok_or_else(|| StoreError::NotFound(document.id.to_string()))?;

        if current.etag != Some(expected) {
            return Err(StoreError::ConcurrencyConflict {
                id: document.id.to_string(),
                expected,
                actual: current.etag,
            });
        }

        document.etag = Some(ETag::new());
        configurations.insert(document.id, document.clone());
        Ok(document)
    }

    async fn remove_configuration(&self, id: ConfigurationId) -> Result<()> {
        self.configurations.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SagaStoreExt;

    fn create_test_document(saga_id: SagaId, step: u32) -> SagaDocument {
        SagaDocument::new(
            saga_id,
            "TestSaga",
            serde_json::json!({"current_step": step}),
        )
    }

    fn create_test_snapshot(saga_id: SagaId) -> SnapshotEnvelope {
        SnapshotEnvelope::new(saga_id, "TestSaga", None, serde_json::json!({"test": true}))
    }

    #[tokio::test]
    async fn create_and_get_saga() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let created = store
            .create_saga(create_test_document(saga_id, 1))
            .await
            .unwrap();
        assert!(created.etag.is_some());

        let loaded = store.get_saga(saga_id).await.unwrap().unwrap();
        assert_eq!(loaded.etag, created.etag);
        assert_eq!(loaded.state, serde_json::json!({"current_step": 1}));
    }

    #[tokio::test]
    async fn create_twice_fails() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        store
            .create_saga(create_test_document(saga_id, 1))
            .await
            .unwrap();
        let result = store.create_saga(create_test_document(saga_id, 1)).await;

        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn save_with_current_etag_stamps_new_etag() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let created = store
            .create_saga(create_test_document(saga_id, 1))
            .await
            .unwrap();
        let saved = store
            .save_saga(created.etag.unwrap(), create_test_document(saga_id, 2))
            .await
            .unwrap();

        assert_ne!(saved.etag, created.etag);
        let loaded = store.get_saga(saga_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, serde_json::json!({"current_step": 2}));
    }

    #[tokio::test]
    async fn save_with_stale_etag_conflicts() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let created = store
            .create_saga(create_test_document(saga_id, 1))
            .await
            .unwrap();
        let stale = created.etag.unwrap();
        store
            .save_saga(stale, create_test_document(saga_id, 2))
            .await
            .unwrap();

        let result = store
            .save_saga(stale, create_test_document(saga_id, 3))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn save_missing_saga_fails() {
        let store = InMemorySagaStore::new();
        let result = store
            .save_saga(ETag::new(), create_test_document(SagaId::new(), 1))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn upsert_creates_then_saves() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        let created = store
            .upsert_saga(None, create_test_document(saga_id, 1))
            .await
            .unwrap();
        let saved = store
            .upsert_saga(created.etag, create_test_document(saga_id, 2))
            .await
            .unwrap();

        assert!(saved.etag.is_some());
        assert!(store.saga_exists(saga_id).await.unwrap());
    }

    #[tokio::test]
    async fn snapshots_are_sequenced_per_saga() {
        let store = InMemorySagaStore::new();
        let saga1 = SagaId::new();
        let saga2 = SagaId::new();

        let first = store
            .append_snapshot(create_test_snapshot(saga1))
            .await
            .unwrap();
        let other = store
            .append_snapshot(create_test_snapshot(saga2))
            .await
            .unwrap();
        let second = store
            .append_snapshot(create_test_snapshot(saga1))
            .await
            .unwrap();

        assert_eq!(first.sequence, Sequence::first());
        assert_eq!(other.sequence, Sequence::first());
        assert_eq!(second.sequence, Sequence::new(2));

        let latest = store.latest_snapshot(saga1).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, second.snapshot_id);
        assert_eq!(store.snapshot_count(saga1).await.unwrap(), 2);
        assert_eq!(store.total_snapshot_count().await, 3);
    }

    #[tokio::test]
    async fn removing_saga_keeps_history() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();

        store
            .create_saga(create_test_document(saga_id, 1))
            .await
            .unwrap();
        store
            .append_snapshot(create_test_snapshot(saga_id))
            .await
            .unwrap();

        store.remove_saga(saga_id).await.unwrap();

        assert!(store.get_saga(saga_id).await.unwrap().is_none());
        assert!(store.is_removed(saga_id).await.unwrap());
        assert_eq!(store.snapshot_count(saga_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_saga_is_not_removed() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();
        store
            .append_snapshot(create_test_snapshot(saga_id))
            .await
            .unwrap();

        assert!(!store.is_removed(saga_id).await.unwrap());
    }

    #[tokio::test]
    async fn latest_snapshot_not_found() {
        let store = InMemorySagaStore::new();
        let result = store.latest_snapshot(SagaId::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn stream_snapshots() {
        use futures_util::StreamExt;

        let store = InMemorySagaStore::new();
        store
            .append_snapshot(create_test_snapshot(SagaId::new()))
            .await
            .unwrap();
        store
            .append_snapshot(create_test_snapshot(SagaId::new()))
            .await
            .unwrap();

        let stream = store.stream_snapshots().await.unwrap();
        let snapshots: Vec<_> = stream.collect().await;
        assert_eq!(snapshots.len(), 2);
    }

    #[tokio::test]
    async fn configuration_lifecycle() {
        let store = InMemorySagaStore::new();
        let id = ConfigurationId::new();

        let added = store
            .add_configuration(ConfigurationDocument::new(
                id,
                "create-order",
                serde_json::json!({"steps": []}),
            ))
            .await
            .unwrap();
        let etag = added.etag.unwrap();

        let updated = store
            .update_configuration(
                etag,
                ConfigurationDocument::new(id, "create-order-v2", serde_json::json!({"steps": []})),
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "create-order-v2");

        let stale = store
            .update_configuration(
                etag,
                ConfigurationDocument::new(id, "create-order-v3", serde_json::json!({})),
            )
            .await;
        assert!(matches!(stale, Err(StoreError::ConcurrencyConflict { .. })));

        store.remove_configuration(id).await.unwrap();
        assert!(store.get_configuration(id).await.unwrap().is_none());
    }
}
