//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-store --test postgres_integration
//! ```

use std::sync::Arc;

use saga_store::{
    ConfigurationDocument, ConfigurationId, ConfigurationStore, ETag, PostgresSagaStore,
    SagaDocument, SagaId, SagaStore, SagaStoreExt, Sequence, SnapshotEnvelope, StoreError,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_records, saga_removals, saga_snapshots, saga_configurations")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

fn record(saga_id: SagaId, current_step: u32) -> SagaDocument {
    SagaDocument::new(
        saga_id,
        "CreateOrderSaga",
        serde_json::json!({ "current_step": current_step }),
    )
}

fn snapshot(saga_id: SagaId, etag: Option<ETag>, current_step: u32) -> SnapshotEnvelope {
    SnapshotEnvelope::new(
        saga_id,
        "CreateOrderSaga",
        etag,
        serde_json::json!({ "current_step": current_step }),
    )
}

#[tokio::test]
#[serial]
async fn create_and_get_record() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let created = store.create_saga(record(saga_id, 1)).await.unwrap();
    assert!(created.etag.is_some());

    let loaded = store.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.saga_id, saga_id);
    assert_eq!(loaded.saga_type, "CreateOrderSaga");
    assert_eq!(loaded.etag, created.etag);
    assert_eq!(loaded.state["current_step"], 1);
}

#[tokio::test]
#[serial]
async fn create_duplicate_record_fails() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    store.create_saga(record(saga_id, 1)).await.unwrap();
    let result = store.create_saga(record(saga_id, 1)).await;

    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
}

#[tokio::test]
#[serial]
async fn save_with_current_etag_rotates_it() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let created = store.create_saga(record(saga_id, 1)).await.unwrap();
    let first = created.etag.unwrap();

    let saved = store.save_saga(first, record(saga_id, 2)).await.unwrap();

    assert_ne!(saved.etag, Some(first));
    let loaded = store.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.etag, saved.etag);
    assert_eq!(loaded.state["current_step"], 2);
}

#[tokio::test]
#[serial]
async fn save_with_stale_etag_conflicts() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let created = store.create_saga(record(saga_id, 1)).await.unwrap();
    let stale = created.etag.unwrap();
    store.save_saga(stale, record(saga_id, 2)).await.unwrap();

    let result = store.save_saga(stale, record(saga_id, 3)).await;

    assert!(matches!(
        result,
        Err(StoreError::ConcurrencyConflict { expected, .. }) if expected == stale
    ));
    let loaded = store.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(loaded.state["current_step"], 2);
}

#[tokio::test]
#[serial]
async fn save_missing_record_fails() {
    let store = get_test_store().await;

    let result = store.save_saga(ETag::new(), record(SagaId::new(), 1)).await;

    assert!(matches!(result, Err(StoreError::NotFound(_))));
}

#[tokio::test]
#[serial]
async fn upsert_creates_then_saves() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();

    let created = store.upsert_saga(None, record(saga_id, 1)).await.unwrap();
    let saved = store
        .upsert_saga(created.etag, record(saga_id, 2))
        .await
        .unwrap();

    assert_ne!(created.etag, saved.etag);
    assert!(store.saga_exists(saga_id).await.unwrap());
}

#[tokio::test]
#[serial]
async fn remove_record_keeps_snapshots() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let created = store.create_saga(record(saga_id, 1)).await.unwrap();
    store
        .append_snapshot(snapshot(saga_id, created.etag, 1))
        .await
        .unwrap();

    store.remove_saga(saga_id).await.unwrap();

    assert!(store.get_saga(saga_id).await.unwrap().is_none());
    assert!(store.is_removed(saga_id).await.unwrap());
    assert_eq!(store.snapshot_count(saga_id).await.unwrap(), 1);

    // Removing twice keeps a single marker.
    store.remove_saga(saga_id).await.unwrap();
    assert!(store.is_removed(saga_id).await.unwrap());
    assert!(!store.is_removed(SagaId::new()).await.unwrap());
}

#[tokio::test]
#[serial]
async fn append_assigns_contiguous_sequences() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    let other_id = SagaId::new();

    for step in 1..=3 {
        let stored = store
            .append_snapshot(snapshot(saga_id, None, step))
            .await
            .unwrap();
        assert_eq!(stored.sequence, Sequence::new(step as i64));
    }
    let other = store
        .append_snapshot(snapshot(other_id, None, 1))
        .await
        .unwrap();
    assert_eq!(other.sequence, Sequence::first());

    let history = store.snapshots_for_saga(saga_id).await.unwrap();
    let sequences: Vec<i64> = history.iter().map(|s| s.sequence.as_i64()).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
#[serial]
async fn latest_snapshot_has_highest_sequence() {
    let store = get_test_store().await;
    let saga_id = SagaId::new();
    assert!(store.latest_snapshot(saga_id).await.unwrap().is_none());

    let etag = ETag::new();
    store
        .append_snapshot(snapshot(saga_id, None, 1))
        .await
        .unwrap();
    store
        .append_snapshot(snapshot(saga_id, Some(etag), 2))
        .await
        .unwrap();

    let latest = store.latest_snapshot(saga_id).await.unwrap().unwrap();
    assert_eq!(latest.sequence, Sequence::new(2));
    assert_eq!(latest.etag, Some(etag));
    assert_eq!(latest.state_ref()["current_step"], 2);
}

#[tokio::test]
#[serial]
async fn stream_all_snapshots() {
    use futures_util::StreamExt;

    let store = get_test_store().await;
    let first = SagaId::new();
    let second = SagaId::new();
    for saga_id in [first, second] {
        for step in 1..=2 {
            store
                .append_snapshot(snapshot(saga_id, None, step))
                .await
                .unwrap();
        }
    }

    let stream = store.stream_snapshots().await.unwrap();
    let snapshots: Vec<SnapshotEnvelope> = stream.map(|s| s.unwrap()).collect().await;

    assert_eq!(snapshots.len(), 4);
    for saga_id in [first, second] {
        let sequences: Vec<i64> = snapshots
            .iter()
            .filter(|s| s.saga_id == saga_id)
            .map(|s| s.sequence.as_i64())
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }
}

#[tokio::test]
#[serial]
async fn configuration_lifecycle() {
    let store = get_test_store().await;
    let id = ConfigurationId::new();

    let added = store
        .add_configuration(ConfigurationDocument::new(
            id,
            "create-order",
            serde_json::json!([{ "sequence": 1 }]),
        ))
        .await
        .unwrap();
    let first = added.etag.unwrap();

    let mut changed = added.clone();
    changed.name = "create-order-v2".to_string();
    let updated = store.update_configuration(first, changed).await.unwrap();
    assert_ne!(updated.etag, Some(first));

    let stale = store.update_configuration(first, added).await;
    assert!(matches!(stale, Err(StoreError::ConcurrencyConflict { .. })));

    let loaded = store.get_configuration(id).await.unwrap().unwrap();
    assert_eq!(loaded.name, "create-order-v2");

    store.remove_configuration(id).await.unwrap();
    assert!(store.get_configuration(id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn duplicate_configuration_fails() {
    let store = get_test_store().await;
    let document =
        ConfigurationDocument::new(ConfigurationId::new(), "create-order", serde_json::json!([]));

    store.add_configuration(document.clone()).await.unwrap();
    let result = store.add_configuration(document).await;

    assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
}
