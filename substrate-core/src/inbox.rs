//! The Inbox: exactly-once handling of inbound integration events, keyed by
//! `(event_id, consumer)`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::backoff::backoff;
use crate::codec::Codec;
use crate::error::{Cancelled, InboxError, InvalidArgument, RepositoryError};
use crate::records::{DeliveryStatus, InboxRecord};
use crate::repository::{Record, Repository};

/// Query vocabulary over [`InboxRecord`]s.
#[derive(Debug, Clone)]
pub enum InboxSpec {
    ByKey { event_id: Uuid, consumer: String },
    ByKeys { keys: Vec<(Uuid, String)> },
}

/// Mutation vocabulary over [`InboxRecord`]s.
#[derive(Debug, Clone)]
pub enum InboxUpdate {
    Complete { now: DateTime<Utc> },
    Fail {
        attempt_count: i32,
        next_attempt_on: DateTime<Utc>,
        error_message: String,
        now: DateTime<Utc>,
    },
    /// Re-leases an eligible `OnError` row for another attempt, without
    /// touching `attempt_count` (that only changes on `fail`).
    Release {
        claim_id: Uuid,
        leased_until: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

impl Record for InboxRecord {
    type Spec = InboxSpec;
    type Update = InboxUpdate;
}

/// Outcome of [`Inbox::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveResult {
    /// A fresh lease was granted; the caller should process the event now.
    Accepted,
    /// Already handled successfully; the caller should drop the event.
    Duplicate,
    /// Currently leased (by this or another worker) and not yet eligible
    /// for retry; the caller should come back later.
    Processing,
}

/// Describes one failure to report through [`Inbox::fail`].
#[derive(Debug, Clone)]
pub struct FailedInboxEvent {
    pub event_id: Uuid,
    pub consumer: String,
    pub error_message: String,
}

pub struct Inbox<R>
where
    R: Repository<InboxRecord>,
{
    repo: Arc<R>,
}

impl<R> Inbox<R>
where
    R: Repository<InboxRecord>,
{
    pub fn new(repo: R) -> Self {
        Self {
            repo: Arc::new(repo),
        }
    }

    /// Classifies and, if accepted, leases `event_id` for `consumer`.
    ///
    /// `event_name`/`payload` are only used when a brand-new row must be
    /// inserted; an existing row's payload is never overwritten, matching
    /// the "insertion is the idempotency key" contract.
    #[tracing::instrument(skip(self, payload, correlation_id, causation_id, cancel))]
    pub async fn receive(
        &self,
        event_id: Uuid,
        consumer: impl Into<String>,
        event_name: impl Into<String>,
        payload: Vec<u8>,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        visibility_timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<ReceiveResult, InboxError> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let consumer = consumer.into();
        let now = Utc::now();

        let existing = self
            .repo
            .query_first(
                InboxSpec::ByKey {
                    event_id,
                    consumer: consumer.clone(),
                },
                cancel,
            )
            .await
            .map_err(RepositoryError::new)?;

        match existing {
            None => {
                let claim_id = Uuid::new_v4();
                let record = InboxRecord {
                    event_id,
                    consumer,
                    event_name: event_name.into(),
                    payload,
                    status: DeliveryStatus::Processing,
                    attempt_count: 0,
                    next_attempt_on: Some(now + visibility_timeout),
                    claim_id: Some(claim_id),
                    error_message: None,
                    correlation_id,
                    causation_id,
                    created_on: now,
                    updated_on: None,
                };

                if self.repo.insert(vec![record], cancel).await.is_err() {
                    // Another worker won the race to insert this key first.
                    return Ok(ReceiveResult::Processing);
                }

                Ok(ReceiveResult::Accepted)
            }
            Some(record) => match record.status {
                DeliveryStatus::Published => Ok(ReceiveResult::Duplicate),
                DeliveryStatus::Processing => Ok(ReceiveResult::Processing),
                DeliveryStatus::OnError => {
                    let eligible = record.next_attempt_on.map_or(true, |at| at <= now);
                    if !eligible {
                        return Ok(ReceiveResult::Processing);
                    }

                    let claim_id = Uuid::new_v4();
                    let affected = self
                        .repo
                        .bulk_update(
                            InboxSpec::ByKey {
                                event_id: record.event_id,
                                consumer: record.consumer.clone(),
                            },
                            InboxUpdate::Release {
                                claim_id,
                                leased_until: now + visibility_timeout,
                                now,
                            },
                            cancel,
                        )
                        .await
                        .map_err(RepositoryError::new)?;

                    if affected == 0 {
                        // Raced with another worker's reclamation.
                        return Ok(ReceiveResult::Processing);
                    }

                    Ok(ReceiveResult::Accepted)
                }
                DeliveryStatus::Pending => Ok(ReceiveResult::Accepted),
            },
        }
    }

    /// Marks `(event_id, consumer)` pairs as published.
    #[tracing::instrument(skip(self, keys, cancel), fields(key_count = keys.len()))]
    pub async fn complete(
        &self,
        keys: Vec<(Uuid, String)>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<u64, InboxError> {
        if keys.is_empty() {
            return Err(InvalidArgument("complete requires at least one key".into()).into());
        }

        self.repo
            .bulk_update(
                InboxSpec::ByKeys { keys },
                InboxUpdate::Complete { now: Utc::now() },
                cancel,
            )
            .await
            .map_err(|err| RepositoryError::new(err).into())
    }

    /// Applies the shared exponential backoff schedule to each failure, one
    /// repository call per failure.
    #[tracing::instrument(skip(self, failures, cancel), fields(failure_count = failures.len()))]
    pub async fn fail(
        &self,
        failures: Vec<FailedInboxEvent>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), InboxError> {
        if failures.is_empty() {
            return Err(InvalidArgument("fail requires at least one failure".into()).into());
        }

        for failure in failures {
            tracing::warn!(event_id = %failure.event_id, consumer = %failure.consumer, error = %failure.error_message, "inbox event handling failed");
            let existing = self
                .repo
                .query_first(
                    InboxSpec::ByKey {
                        event_id: failure.event_id,
                        consumer: failure.consumer.clone(),
                    },
                    cancel,
                )
                .await
                .map_err(RepositoryError::new)?;

            let attempt_count = existing.map_or(0, |record| record.attempt_count) + 1;
            let now = Utc::now();

            self.repo
                .bulk_update(
                    InboxSpec::ByKey {
                        event_id: failure.event_id,
                        consumer: failure.consumer,
                    },
                    InboxUpdate::Fail {
                        attempt_count,
                        next_attempt_on: now + backoff(attempt_count),
                        error_message: failure.error_message,
                        now,
                    },
                    cancel,
                )
                .await
                .map_err(RepositoryError::new)?;
        }

        Ok(())
    }
}
