//! [`Repository<DomainEventRecord>`] backed by `sqlx::PgPool`, grounded in
//! `eventually-postgres::event::{append_domain_event, Store}`: one
//! transaction per call, rows streamed lazily via `async_stream::stream!`
//! the way `disintegrate-postgres`'s `PgEventStore::stream_with` does.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use substrate_core::records::{DomainEventRecord, DomainEventStatus};
use substrate_core::repository::{RecordStream, Repository};
use substrate_core::store::{DomainEventSpec, DomainEventUpdate};
use tokio_util::sync::CancellationToken;

use crate::error::{try_get_column, PgRepositoryError};

#[derive(Debug, Clone)]
pub struct PgDomainEventRepository {
    pool: PgPool,
}

impl PgDomainEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_to_db(status: DomainEventStatus) -> &'static str {
    match status {
        DomainEventStatus::Active => "ACTIVE",
        DomainEventStatus::Deleted => "DELETED",
    }
}

fn status_from_db(raw: &str) -> Result<DomainEventStatus, PgRepositoryError> {
    match raw {
        "ACTIVE" => Ok(DomainEventStatus::Active),
        "DELETED" => Ok(DomainEventStatus::Deleted),
        other => Err(PgRepositoryError::Decode {
            name: "status",
            cause: anyhow::anyhow!("unrecognized domain_event_status '{other}'"),
        }),
    }
}

fn row_to_record(row: PgRow) -> Result<DomainEventRecord, PgRepositoryError> {
    let status_raw: String = try_get_column(&row, "status")?;

    Ok(DomainEventRecord {
        event_id: try_get_column(&row, "event_id")?,
        stream_id: try_get_column(&row, "stream_id")?,
        stream_name: try_get_column(&row, "stream_name")?,
        stream_version: try_get_column(&row, "stream_version")?,
        sequence: try_get_column(&row, "sequence")?,
        event_name: try_get_column(&row, "event_name")?,
        payload: try_get_column(&row, "payload")?,
        causation_id: try_get_column(&row, "causation_id")?,
        correlation_id: try_get_column(&row, "correlation_id")?,
        status: status_from_db(&status_raw)?,
        created_on: try_get_column(&row, "created_on")?,
        updated_on: try_get_column(&row, "updated_on")?,
        deleted_on: try_get_column(&row, "deleted_on")?,
    })
}

#[async_trait]
impl Repository<DomainEventRecord> for PgDomainEventRepository {
    type Error = PgRepositoryError;

    #[tracing::instrument(skip_all, fields(batch_len = batch.len()))]
    async fn insert(
        &self,
        batch: Vec<DomainEventRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"INSERT INTO domain_events
                   (event_id, stream_id, stream_name, stream_version, event_name,
                    payload, causation_id, correlation_id, status, created_on)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::domain_event_status, $10)"#,
            )
            .bind(record.event_id)
            .bind(record.stream_id)
            .bind(&record.stream_name)
            .bind(record.stream_version)
            .bind(&record.event_name)
            .bind(&record.payload)
            .bind(&record.causation_id)
            .bind(&record.correlation_id)
            .bind(status_to_db(record.status))
            .bind(record.created_on)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn query(
        &self,
        spec: DomainEventSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, DomainEventRecord, Self::Error> {
        let pool = self.pool.clone();

        stream! {
            let mut rows = match spec {
                DomainEventSpec::StreamFrom { stream_id, from_version, max_count } => {
                    sqlx::query(
                        r#"SELECT * FROM domain_events
                           WHERE stream_id = $1 AND stream_version > $2 AND status = 'ACTIVE'
                           ORDER BY stream_version
                           LIMIT $3"#,
                    )
                    .bind(stream_id)
                    .bind(from_version)
                    .bind(max_count as i64)
                    .fetch(&pool)
                }
                DomainEventSpec::AllFrom { from_position, max_count } => {
                    sqlx::query(
                        r#"SELECT * FROM domain_events
                           WHERE sequence > $1 AND status = 'ACTIVE'
                           ORDER BY sequence
                           LIMIT $2"#,
                    )
                    .bind(from_position)
                    .bind(max_count as i64)
                    .fetch(&pool)
                }
                DomainEventSpec::LatestActiveForStream { stream_id } => {
                    sqlx::query(
                        r#"SELECT * FROM domain_events
                           WHERE stream_id = $1 AND status = 'ACTIVE'
                           ORDER BY stream_version DESC
                           LIMIT 1"#,
                    )
                    .bind(stream_id)
                    .fetch(&pool)
                }
                DomainEventSpec::AnyForStream { stream_id } => {
                    sqlx::query(r#"SELECT * FROM domain_events WHERE stream_id = $1 ORDER BY stream_version"#)
                        .bind(stream_id)
                        .fetch(&pool)
                }
            };

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
        spec: DomainEventSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<DomainEventRecord>, Self::Error> {
        self.query(spec, cancel).try_next().await
    }

    async fn exists(
        &self,
        spec: DomainEventSpec,
        cancel: &CancellationToken,
    ) -> Result<bool, Self::Error> {
        Ok(self.query_first(spec, cancel).await?.is_some())
    }

    #[tracing::instrument(skip(self, _cancel))]
    async fn bulk_update(
        &self,
        spec: DomainEventSpec,
        update: DomainEventUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let result = match (spec, update) {
            (
                DomainEventSpec::AnyForStream { stream_id },
                DomainEventUpdate::SoftDelete { deleted_on },
            ) => {
                sqlx::query(
                    r#"UPDATE domain_events
                       SET status = 'DELETED', deleted_on = $2, updated_on = now()
                       WHERE stream_id = $1 AND status = 'ACTIVE'"#,
                )
                .bind(stream_id)
                .bind(deleted_on)
                .execute(&self.pool)
                .await?
            }
            (DomainEventSpec::AnyForStream { stream_id }, DomainEventUpdate::Undelete) => {
                sqlx::query(
                    r#"UPDATE domain_events
                       SET status = 'ACTIVE', deleted_on = NULL, updated_on = now()
                       WHERE stream_id = $1 AND status = 'DELETED'"#,
                )
                .bind(stream_id)
                .execute(&self.pool)
                .await?
            }
            (spec, _) => {
                return Err(PgRepositoryError::Decode {
                    name: "spec",
                    cause: anyhow::anyhow!("bulk_update does not support spec {spec:?}"),
                })
            }
        };

        Ok(result.rows_affected())
    }

    async fn delete(
        &self,
        spec: DomainEventSpec,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let result = match spec {
            DomainEventSpec::AnyForStream { stream_id } => {
                sqlx::query("DELETE FROM domain_events WHERE stream_id = $1")
                    .bind(stream_id)
                    .execute(&self.pool)
                    .await?
            }
            spec => {
                return Err(PgRepositoryError::Decode {
                    name: "spec",
                    cause: anyhow::anyhow!("delete does not support spec {spec:?}"),
                })
            }
        };

        Ok(result.rows_affected())
    }
}
