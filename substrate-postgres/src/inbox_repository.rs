//! [`Repository<InboxRecord>`] backed by `sqlx::PgPool`. `receive`'s
//! `Release` transition is guarded the same way the outbox claim is: the
//! `UPDATE` re-checks `status`/`next_attempt_on` in its own `WHERE`, so a
//! second worker racing the same eligible row affects zero rows instead of
//! double-leasing it.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use substrate_core::inbox::{InboxSpec, InboxUpdate};
use substrate_core::records::{DeliveryStatus, InboxRecord};
use substrate_core::repository::{RecordStream, Repository};
use tokio_util::sync::CancellationToken;

use crate::error::{try_get_column, PgRepositoryError};

#[derive(Debug, Clone)]
pub struct PgInboxRepository {
    pool: PgPool,
}

impl PgInboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_to_db(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Pending => "PENDING",
        DeliveryStatus::Processing => "PROCESSING",
        DeliveryStatus::Published => "PUBLISHED",
        DeliveryStatus::OnError => "ONERROR",
    }
}

fn status_from_db(raw: &str) -> Result<DeliveryStatus, PgRepositoryError> {
    match raw {
        "PENDING" => Ok(DeliveryStatus::Pending),
        "PROCESSING" => Ok(DeliveryStatus::Processing),
        "PUBLISHED" => Ok(DeliveryStatus::Published),
        "ONERROR" => Ok(DeliveryStatus::OnError),
        other => Err(PgRepositoryError::Decode {
            name: "status",
            cause: anyhow::anyhow!("unrecognized delivery_status '{other}'"),
        }),
    }
}

fn row_to_record(row: PgRow) -> Result<InboxRecord, PgRepositoryError> {
    let status_raw: String = try_get_column(&row, "status")?;

    Ok(InboxRecord {
        event_id: try_get_column(&row, "event_id")?,
        consumer: try_get_column(&row, "consumer")?,
        event_name: try_get_column(&row, "event_name")?,
        payload: try_get_column(&row, "payload")?,
        status: status_from_db(&status_raw)?,
        attempt_count: try_get_column(&row, "attempt_count")?,
        next_attempt_on: try_get_column(&row, "next_attempt_on")?,
        claim_id: try_get_column(&row, "claim_id")?,
        error_message: try_get_column(&row, "error_message")?,
        correlation_id: try_get_column(&row, "correlation_id")?,
        causation_id: try_get_column(&row, "causation_id")?,
        created_on: try_get_column(&row, "created_on")?,
        updated_on: try_get_column(&row, "updated_on")?,
    })
}

#[async_trait]
impl Repository<InboxRecord> for PgInboxRepository {
    type Error = PgRepositoryError;

    #[tracing::instrument(skip_all, fields(batch_len = batch.len()))]
    async fn insert(
        &self,
        batch: Vec<InboxRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"INSERT INTO inbox_events
                   (event_id, consumer, event_name, payload, status, attempt_count,
                    next_attempt_on, claim_id, error_message, correlation_id, causation_id, created_on)
                   VALUES ($1, $2, $3, $4, $5::delivery_status, $6, $7, $8, $9, $10, $11, $12)"#,
            )
            .bind(record.event_id)
            .bind(&record.consumer)
            .bind(&record.event_name)
            .bind(&record.payload)
            .bind(status_to_db(record.status))
            .bind(record.attempt_count)
            .bind(record.next_attempt_on)
            .bind(record.claim_id)
            .bind(&record.error_message)
            .bind(&record.correlation_id)
            .bind(&record.causation_id)
            .bind(record.created_on)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    fn query(
        &self,
        spec: InboxSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, InboxRecord, Self::Error> {
        let pool = self.pool.clone();

        stream! {
            let mut rows = match spec {
                InboxSpec::ByKey { event_id, consumer } => {
                    sqlx::query("SELECT * FROM inbox_events WHERE event_id = $1 AND consumer = $2")
                        .bind(event_id)
                        .bind(consumer)
                        .fetch(&pool)
                }
                InboxSpec::ByKeys { keys } => {
                    let (event_ids, consumers): (Vec<uuid::Uuid>, Vec<String>) = keys.into_iter().unzip();
                    sqlx::query(
                        r#"SELECT * FROM inbox_events
                           WHERE (event_id, consumer) IN (
                               SELECT * FROM UNNEST($1::uuid[], $2::text[])
                           )"#,
                    )
                    .bind(event_ids)
                    .bind(consumers)
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
        spec: InboxSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<InboxRecord>, Self::Error> {
        self.query(spec, cancel).try_next().await
    }

    async fn exists(
        &self,
        spec: InboxSpec,
        cancel: &CancellationToken,
    ) -> Result<bool, Self::Error> {
        Ok(self.query_first(spec, cancel).await?.is_some())
    }

    #[tracing::instrument(skip(self, _cancel))]
    async fn bulk_update(
        &self,
        spec: InboxSpec,
        update: InboxUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        match (spec, update) {
            (InboxSpec::ByKeys { keys }, InboxUpdate::Complete { now }) => {
                let (event_ids, consumers): (Vec<uuid::Uuid>, Vec<String>) = keys.into_iter().unzip();

                let result = sqlx::query(
                    r#"UPDATE inbox_events
                       SET status = 'PUBLISHED', claim_id = NULL, next_attempt_on = NULL,
                           error_message = NULL, updated_on = $3
                       WHERE (event_id, consumer) IN (
                           SELECT * FROM UNNEST($1::uuid[], $2::text[])
                       )"#,
                )
                .bind(event_ids)
                .bind(consumers)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            }

            (
                InboxSpec::ByKey { event_id, consumer },
                InboxUpdate::Fail { attempt_count, next_attempt_on, error_message, now },
            ) => {
                let result = sqlx::query(
                    r#"UPDATE inbox_events
                       SET status = 'ONERROR', claim_id = NULL, attempt_count = $3,
                           next_attempt_on = $4, error_message = $5, updated_on = $6
                       WHERE event_id = $1 AND consumer = $2"#,
                )
                .bind(event_id)
                .bind(consumer)
                .bind(attempt_count)
                .bind(next_attempt_on)
                .bind(error_message)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            }

            (
                InboxSpec::ByKey { event_id, consumer },
                InboxUpdate::Release { claim_id, leased_until, now },
            ) => {
                let result = sqlx::query(
                    r#"UPDATE inbox_events
                       SET status = 'PROCESSING', claim_id = $3, next_attempt_on = $4, updated_on = $5
                       WHERE event_id = $1 AND consumer = $2
                         AND status = 'ONERROR'
                         AND (next_attempt_on IS NULL OR next_attempt_on <= $5)"#,
                )
                .bind(event_id)
                .bind(consumer)
                .bind(claim_id)
                .bind(leased_until)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            }

            (spec, update) => Err(PgRepositoryError::Decode {
                name: "spec",
                cause: anyhow::anyhow!("bulk_update does not support ({spec:?}, {update:?})"),
            }),
        }
    }

    async fn delete(
        &self,
        spec: InboxSpec,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let InboxSpec::ByKeys { keys } = spec else {
            return Err(PgRepositoryError::Decode {
                name: "spec",
                cause: anyhow::anyhow!("delete only supports InboxSpec::ByKeys"),
            });
        };

        let (event_ids, consumers): (Vec<uuid::Uuid>, Vec<String>) = keys.into_iter().unzip();

        let result = sqlx::query(
            r#"DELETE FROM inbox_events
               WHERE (event_id, consumer) IN (SELECT * FROM UNNEST($1::uuid[], $2::text[]))"#,
        )
        .bind(event_ids)
        .bind(consumers)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
