use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row, postgres::PgPoolOptions, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ConfigurationDocument, ConfigurationId, ETag, Result, SagaDocument, SagaId, Sequence,
    SnapshotEnvelope, SnapshotId, StoreError,
    store::{ConfigurationStore, SagaStore, SnapshotStream},
};

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url` with a bounded connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: PgRow) -> Result<SagaDocument> {
        Ok(SagaDocument {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            etag: Some(ETag::from_uuid(row.try_get::<Uuid, _>("etag")?)),
            updated_at: row.try_get("updated_at")?,
            state: row.try_get("state")?,
        })
    }

    fn row_to_snapshot(row: PgRow) -> Result<SnapshotEnvelope> {
        Ok(SnapshotEnvelope {
            snapshot_id: SnapshotId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            sequence: Sequence::new(row.try_get("sequence")?),
            etag: row
                .try_get::<Option<Uuid>, _>("etag")?
                .map(ETag::from_uuid),
            timestamp: row.try_get("timestamp")?,
            state: row.try_get("state")?,
        })
    }

    fn row_to_configuration(row: PgRow) -> Result<ConfigurationDocument> {
        Ok(ConfigurationDocument {
            id: ConfigurationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            name: row.try_get("name")?,
            etag: Some(ETag::from_uuid(row.try_get::<Uuid, _>("etag")?)),
            definition: row.try_get("definition")?,
        })
    }

    async fn current_etag(&self, table: &str, key: &str, id: Uuid) -> Result<Option<ETag>> {
        let sql = format!("SELECT etag FROM {table} WHERE {key} = $1");
        let etag: Option<Uuid> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(etag.map(ETag::from_uuid))
    }
}

fn is_unique_violation(error: &sqlx::Error, constraint: &str) -> bool {
    matches!(error, sqlx::Error::Database(db_err) if db_err.constraint() == Some(constraint))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaDocument>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT saga_id, saga_type, etag, updated_at, state
            FROM saga_records
            WHERE saga_id = $1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn create_saga(&self, mut document: SagaDocument) -> Result<SagaDocument> {
        let etag = ETag::new();
        let updated_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO saga_records (saga_id, saga_type, etag, updated_at, state)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(document.saga_id.as_uuid())
        .bind(&document.saga_type)
        .bind(etag.as_uuid())
        .bind(updated_at)
        .bind(&document.state)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "saga_records_pkey") {
                return StoreError::AlreadyExists(document.saga_id.to_string());
            }
            StoreError::Database(e)
        })?;

        document.etag = Some(etag);
        document.updated_at = updated_at;
        Ok(document)
    }

    async fn save_saga(&self, expected: ETag, mut document: SagaDocument) -> Result<SagaDocument> {
        let etag = ETag::new();
        let updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE saga_records
            SET saga_type = $2, etag = $3, updated_at = $4, state = $5
            WHERE saga_id = $1 AND etag = $6
            "#,
        )
        .bind(document.saga_id.as_uuid())
        .bind(&document.saga_type)
        .bind(etag.as_uuid())
        .bind(updated_at)
        .bind(&document.state)
        .bind(expected.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self
                .current_etag("saga_records", "saga_id", document.saga_id.as_uuid())
                .await?;
            return match actual {
                None => Err(StoreError::NotFound(document.saga_id.to_string())),
                Some(_) => {
                    metrics::counter!("saga_store_concurrency_conflicts_total").increment(1);
                    tracing::warn!(
                        saga_id = %document.saga_id,
                        %expected,
                        "saga record changed concurrently"
                    );
                    Err(StoreError::ConcurrencyConflict {
                        id: document.saga_id.to_string(),
                        expected,
                        actual,
                    })
                }
            };
        }

        document.etag = Some(etag);
        document.updated_at = updated_at;
        Ok(document)
    }

    async fn remove_saga(&self, saga_id: SagaId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM saga_records WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO saga_removals (saga_id, removed_at)
            VALUES ($1, $2)
            ON CONFLICT (saga_id) DO NOTHING
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn is_removed(&self, saga_id: SagaId) -> Result<bool> {
        let removed: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM saga_removals WHERE saga_id = $1)")
                .bind(saga_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(removed)
    }

    async fn append_snapshot(&self, mut snapshot: SnapshotEnvelope) -> Result<SnapshotEnvelope> {
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query_scalar("SELECT MAX(sequence) FROM saga_snapshots WHERE saga_id = $1")
                .bind(snapshot.saga_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;

        snapshot.sequence = Sequence::new(current.unwrap_or(0)).next();
        snapshot.timestamp = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO saga_snapshots (id, saga_id, saga_type, sequence, etag, timestamp, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(snapshot.snapshot_id.as_uuid())
        .bind(snapshot.saga_id.as_uuid())
        .bind(&snapshot.saga_type)
        .bind(snapshot.sequence.as_i64())
        .bind(snapshot.etag.map(|e| e.as_uuid()))
        .bind(snapshot.timestamp)
        .bind(&snapshot.state)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "unique_saga_sequence") {
                tracing::warn!(
                    saga_id = %snapshot.saga_id,
                    sequence = %snapshot.sequence,
                    "snapshot sequence taken by a concurrent writer"
                );
                return StoreError::SequenceConflict {
                    saga_id: snapshot.saga_id,
                    sequence: snapshot.sequence,
                };
            }
            StoreError::Database(e)
        })?;

        tx.commit().await?;
        Ok(snapshot)
    }

    async fn latest_snapshot(&self, saga_id: SagaId) -> Result<Option<SnapshotEnvelope>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, saga_id, saga_type, sequence, etag, timestamp, state
            FROM saga_snapshots
            WHERE saga_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_snapshot).transpose()
    }

    async fn snapshots_for_saga(&self, saga_id: SagaId) -> Result<Vec<SnapshotEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, saga_type, sequence, etag, timestamp, state
            FROM saga_snapshots
            WHERE saga_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_snapshot).collect()
    }

    async fn stream_snapshots(&self) -> Result<SnapshotStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT id, saga_id, saga_type, sequence, etag, timestamp, state
            FROM saga_snapshots
            ORDER BY saga_id ASC, sequence ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_snapshot(row),
            Err(e) => Err(StoreError::Database(e)),
        });

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ConfigurationStore for PostgresSagaStore {
    async fn get_configuration(
        &self,
        id: ConfigurationId,
    ) -> Result<Option<ConfigurationDocument>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT id, name, etag, definition
            FROM saga_configurations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_configuration).transpose()
    }

    async fn add_configuration(
        &self,
        mut document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument> {
        let etag = ETag::new();

        sqlx::query(
            r#"
            INSERT INTO saga_configurations (id, name, etag, definition)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(&document.name)
        .bind(etag.as_uuid())
        .bind(&document.definition)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e, "saga_configurations_pkey") {
                return StoreError::AlreadyExists(document.id.to_string());
            }
            StoreError::Database(e)
        })?;

        document.etag = Some(etag);
        Ok(document)
    }

    async fn update_configuration(
        &self,
        expected: ETag,
        mut document: ConfigurationDocument,
    ) -> Result<ConfigurationDocument> {
        let etag = ETag::new();

        let result = sqlx::query(
            r#"
            UPDATE saga_configurations
            SET name = $2, etag = $3, definition = $4
            WHERE id = $1 AND etag = $5
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(&document.name)
        .bind(etag.as_uuid())
        .bind(&document.definition)
        .bind(expected.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual = self
                .current_etag("saga_configurations", "id", document.id.as_uuid())
                .await?;
            return match actual {
                None => Err(StoreError::NotFound(document.id.to_string())),
                Some(_) => Err(StoreError::ConcurrencyConflict {
                    id: document.id.to_string(),
                    expected,
                    actual,
                }),
            };
        }

        document.etag = Some(etag);
        Ok(document)
    }

    async fn remove_configuration(&self, id: ConfigurationId) -> Result<()> {
        sqlx::query("DELETE FROM saga_configurations WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
