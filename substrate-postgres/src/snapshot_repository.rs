//! [`Repository<SnapshotRecord>`] backed by `sqlx::PgPool`. Snapshots are
//! advisory and never mutated in place, so only `insert`/`query`/`query_first`
//! are meaningfully exercised; `bulk_update` and `delete` exist to satisfy the
//! port and are grounded on truncation needs only.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use substrate_core::records::SnapshotRecord;
use substrate_core::repository::{RecordStream, Repository};
use substrate_core::store::SnapshotSpec;
use tokio_util::sync::CancellationToken;

use crate::error::{try_get_column, PgRepositoryError};

#[derive(Debug, Clone)]
pub struct PgSnapshotRepository {
    pool: PgPool,
}

impl PgSnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: PgRow) -> Result<SnapshotRecord, PgRepositoryError> {
    Ok(SnapshotRecord {
        event_id: try_get_column(&row, "event_id")?,
        owner_id: try_get_column(&row, "owner_id")?,
        sequence: try_get_column(&row, "sequence")?,
        event_name: try_get_column(&row, "event_name")?,
        payload: try_get_column(&row, "payload")?,
        created_on: try_get_column(&row, "created_on")?,
    })
}

#[async_trait]
impl Repository<SnapshotRecord> for PgSnapshotRepository {
    type Error = PgRepositoryError;

    #[tracing::instrument(skip_all, fields(batch_len = batch.len()))]
    async fn insert(
        &self,
        batch: Vec<SnapshotRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"INSERT INTO snapshot_events (event_id, owner_id, event_name, payload, created_on)
                   VALUES ($1, $2, $3, $4, $5)"#,
            )
            .bind(record.event_id)
            .bind(record.owner_id)
            .bind(&record.event_name)
            .bind(&record.payload)
            .bind(record.created_on)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn query(
        &self,
        spec: SnapshotSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, SnapshotRecord, Self::Error> {
        let pool = self.pool.clone();

        stream! {
            let SnapshotSpec::LatestForOwner { owner_id } = spec;

            let mut rows = sqlx::query(
                r#"SELECT * FROM snapshot_events
                   WHERE owner_id = $1
                   ORDER BY sequence DESC
                   LIMIT 1"#,
            )
            .bind(owner_id)
            .fetch(&pool);

            while let Some(row) = rows.next().await {
                match row {
                    Ok(row) => yield row_to_record(row),
                    Err(err) => yield Err(PgRepositoryError::from(err)),
                }
            }
        }
        .boxed()
    }

    async fn query_first(
        &self,
        spec: SnapshotSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<SnapshotRecord>, Self::Error> {
        self.query(spec, cancel).try_next().await
    }

    async fn exists(
        &self,
        spec: SnapshotSpec,
        cancel: &CancellationToken,
    ) -> Result<bool, Self::Error> {
        Ok(self.query_first(spec, cancel).await?.is_some())
    }

    async fn bulk_update(
        &self,
        _spec: SnapshotSpec,
        update: std::convert::Infallible,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        match update {}
    }

    async fn delete(
        &self,
        spec: SnapshotSpec,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let SnapshotSpec::LatestForOwner { owner_id } = spec;

        let result = sqlx::query("DELETE FROM snapshot_events WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
