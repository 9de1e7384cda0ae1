use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{
    ConfigurationDocument, ConfigurationId, ETag, Result, SagaDocument, SagaId, SnapshotEnvelope,
};

/// A stream of snapshots.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<SnapshotEnvelope>> + Send>>;

/// Storage for saga records and their snapshot history.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Retrieves the current record of a saga.
    ///
    /// Returns None if the saga has no record.
    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaDocument>>;

    /// Stores a new saga record and stamps its first etag.
    ///
    /// Fails with `AlreadyExists` if a record with the same id exists.
    async fn create_saga(&self, document: SagaDocument) -> Result<SagaDocument>;

    /// Replaces an existing saga record.
    ///
    /// The stored etag must equal `expected`, otherwise the save fails with
    /// `ConcurrencyConflict`. Returns the record with its new etag.
    async fn save_saga(&self, expected: ETag, document: SagaDocument) -> Result<SagaDocument>;

    /// Removes a saga record and marks the saga id as removed. Snapshot
    /// history is kept.
    async fn remove_saga(&self, saga_id: SagaId) -> Result<()>;

    /// Returns true if the saga was removed through `remove_saga`.
    async fn is_removed(&self, saga_id: SagaId) -> Result<bool>;

    /// Appends a snapshot to a saga's history.
    ///
    /// The store assigns the next sequence number for the saga id; the
    /// sequence on the passed envelope is ignored. Returns the stored snapshot.
    async fn append_snapshot(&self, snapshot: SnapshotEnvelope) -> Result<SnapshotEnvelope>;

    /// Retrieves the snapshot with the highest sequence for a saga.
    async fn latest_snapshot(&self, saga_id: SagaId) -> Result<Option<SnapshotEnvelope>>;

    /// Retrieves all snapshots for a saga in sequence order.
    async fn snapshots_for_saga(&self, saga_id: SagaId) -> Result<Vec<SnapshotEnvelope>>;

    /// Streams every snapshot in the store, ordered by saga then sequence.
    async fn stream_snapshots(&self) -> Result<SnapshotStream>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Creates the record if `expected` is None, saves it otherwise.
    async fn upsert_saga(
        &self,
        expected: Option<ETag>,
        document: SagaDocument,
    ) -> Result<SagaDocument> {
        match expected {
            Some(etag) => self.save_saga(etag, document).await,
            None => self.create_saga(document).await,
        }
    }

    /// Returns the number of snapshots stored for a saga.
    async fn snapshot_count(&self, saga_id: SagaId) -> Result<usize> {
        Ok(self.snapshots_for_saga(saga_id).await?.len())
    }

    /// Checks if a saga has a current record.
    async fn saga_exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.get_saga(saga_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Storage for saga configurations.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Retrieves a configuration by id.
    async fn get_configuration(&self, id: ConfigurationId)
    -> Result<Option<ConfigurationDocument>>;

    /// Adds a new configuration and stamps its first etag.
    async fn add_configuration(
        &self,
        document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument>;

    /// Updates a configuration. The stored etag must equal `expected`.
    async fn update_configuration(
        &self,
        expected: ETag,
        document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument>;

    /// Removes a configuration.
    async fn remove_configuration(&self, id: ConfigurationId) -> Result<()>;
}
