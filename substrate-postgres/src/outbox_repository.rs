//! [`Repository<OutboxRecord>`] backed by `sqlx::PgPool`. The claim race
//! fence lives entirely in `claim_and_fetch`'s `SELECT ... FOR UPDATE SKIP
//! LOCKED` CTE: two dequeues racing against the same candidate set each
//! walk away with disjoint rows instead of double-claiming one.

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use substrate_core::outbox::{OutboxSpec, OutboxUpdate};
use substrate_core::records::{DeliveryStatus, OutboxRecord};
use substrate_core::repository::{RecordStream, Repository};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{try_get_column, PgRepositoryError};

#[derive(Debug, Clone)]
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
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

fn row_to_record(row: PgRow) -> Result<OutboxRecord, PgRepositoryError> {
    let status_raw: String = try_get_column(&row, "status")?;

    Ok(OutboxRecord {
        event_id: try_get_column(&row, "event_id")?,
        event_name: try_get_column(&row, "event_name")?,
        payload: try_get_column(&row, "payload")?,
        status: status_from_db(&status_raw)?,
        attempt_count: try_get_column(&row, "attempt_count")?,
        next_attempt_on: try_get_column(&row, "next_attempt_on")?,
        claim_id: try_get_column(&row, "claim_id")?,
        error_message: try_get_column(&row, "error_message")?,
        correlation_id: try_get_column(&row, "correlation_id")?,
        causation_id: try_get_column(&row, "causation_id")?,
        sequence: try_get_column(&row, "sequence")?,
        created_on: try_get_column(&row, "created_on")?,
        updated_on: try_get_column(&row, "updated_on")?,
    })
}

#[async_trait]
impl Repository<OutboxRecord> for PgOutboxRepository {
    type Error = PgRepositoryError;

    #[tracing::instrument(skip_all, fields(batch_len = batch.len()))]
    async fn insert(
        &self,
        batch: Vec<OutboxRecord>,
        _cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;

        for record in batch {
            sqlx::query(
                r#"INSERT INTO outbox_events
                   (event_id, event_name, payload, status, attempt_count, next_attempt_on,
                    claim_id, error_message, correlation_id, causation_id, created_on)
                   VALUES ($1, $2, $3, $4::delivery_status, $5, $6, $7, $8, $9, $10, $11)"#,
            )
            .bind(record.event_id)
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
        spec: OutboxSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, OutboxRecord, Self::Error> {
        let pool = self.pool.clone();

        stream! {
            let mut rows = match spec {
                OutboxSpec::Claimable { now, max_count } => {
                    sqlx::query(
                        r#"SELECT * FROM outbox_events
                           WHERE status = 'PENDING'
                              OR (status = 'ONERROR' AND (next_attempt_on IS NULL OR next_attempt_on <= $1))
                              OR (status = 'PROCESSING' AND next_attempt_on <= $1)
                           ORDER BY sequence
                           LIMIT $2"#,
                    )
                    .bind(now)
                    .bind(max_count as i64)
                    .fetch(&pool)
                }
                OutboxSpec::WithClaim { claim_id } => {
                    sqlx::query("SELECT * FROM outbox_events WHERE claim_id = $1 ORDER BY sequence")
                        .bind(claim_id)
                        .fetch(&pool)
                }
                OutboxSpec::ById { event_ids } => {
                    sqlx::query("SELECT * FROM outbox_events WHERE event_id = ANY($1) ORDER BY sequence")
                        .bind(event_ids)
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
        spec: OutboxSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<OutboxRecord>, Self::Error> {
        self.query(spec, cancel).try_next().await
    }

    async fn exists(
        &self,
        spec: OutboxSpec,
        cancel: &CancellationToken,
    ) -> Result<bool, Self::Error> {
        Ok(self.query_first(spec, cancel).await?.is_some())
    }

    #[tracing::instrument(skip(self, _cancel))]
    async fn bulk_update(
        &self,
        spec: OutboxSpec,
        update: OutboxUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        match (spec, update) {
            (
                OutboxSpec::Claimable { now, max_count },
                OutboxUpdate::Claim { claim_id, leased_until, now: claimed_on },
            ) => self.claim(now, max_count, claim_id, leased_until, claimed_on).await,

            (OutboxSpec::ById { event_ids }, OutboxUpdate::Complete { now }) => {
                let result = sqlx::query(
                    r#"UPDATE outbox_events
                       SET status = 'PUBLISHED', claim_id = NULL, next_attempt_on = NULL,
                           error_message = NULL, updated_on = $2
                       WHERE event_id = ANY($1)"#,
                )
                .bind(event_ids)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(result.rows_affected())
            }

            (
                OutboxSpec::ById { event_ids },
                OutboxUpdate::Fail { attempt_count, next_attempt_on, error_message, now },
            ) => {
                let result = sqlx::query(
                    r#"UPDATE outbox_events
                       SET status = 'ONERROR', claim_id = NULL, attempt_count = $2,
                           next_attempt_on = $3, error_message = $4, updated_on = $5
                       WHERE event_id = ANY($1)"#,
                )
                .bind(event_ids)
                .bind(attempt_count)
                .bind(next_attempt_on)
                .bind(error_message)
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
        spec: OutboxSpec,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let OutboxSpec::ById { event_ids } = spec else {
            return Err(PgRepositoryError::Decode {
                name: "spec",
                cause: anyhow::anyhow!("delete only supports OutboxSpec::ById"),
            });
        };

        let result = sqlx::query("DELETE FROM outbox_events WHERE event_id = ANY($1)")
            .bind(event_ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

impl PgOutboxRepository {
    #[tracing::instrument(skip(self))]
    async fn claim(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        max_count: usize,
        claim_id: Uuid,
        leased_until: chrono::DateTime<chrono::Utc>,
        claimed_on: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, PgRepositoryError> {
        let result = sqlx::query(
            r#"WITH candidates AS (
                   SELECT event_id FROM outbox_events
                   WHERE status = 'PENDING'
                      OR (status = 'ONERROR' AND (next_attempt_on IS NULL OR next_attempt_on <= $1))
                      OR (status = 'PROCESSING' AND next_attempt_on <= $1)
                   ORDER BY sequence
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE outbox_events
               SET status = 'PROCESSING', claim_id = $3, next_attempt_on = $4, updated_on = $5
               WHERE event_id IN (SELECT event_id FROM candidates)"#,
        )
        .bind(now)
        .bind(max_count as i64)
        .bind(claim_id)
        .bind(leased_until)
        .bind(claimed_on)
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected();
        tracing::debug!(claimed, %claim_id, "outbox claim round completed");
        Ok(claimed)
    }
}
