//! The Outbox: at-least-once publishing of integration events via a
//! transactional enqueue and a claim-with-lease dequeue.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::backoff::backoff;
use crate::codec::Codec;
use crate::error::{Cancelled, InvalidArgument, OutboxError, RepositoryError};
use crate::event::{Envelope, Event};
use crate::records::{DeliveryStatus, OutboxRecord};
use crate::repository::{Record, Repository};

/// Default claim lease duration: how long a dequeued batch stays
/// `Processing` before another worker may reclaim it as an expired lease.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECONDS: i64 = 5 * 60;

/// Default `dequeue` batch size when the caller does not specify one.
pub const DEFAULT_MAX_DEQUEUE_BATCH: usize = 10;

/// Query vocabulary over [`OutboxRecord`]s.
#[derive(Debug, Clone)]
pub enum OutboxSpec {
    /// Candidates for claiming: `Pending`, eligible `OnError`, or an
    /// expired-lease `Processing` row, ordered by `sequence` ascending.
    Claimable { now: DateTime<Utc>, max_count: usize },
    /// The exact ids carrying `claim_id`, used to re-read a batch after
    /// claiming it (so the caller gets back decoded events, not raw rows).
    WithClaim { claim_id: Uuid },
    ById { event_ids: Vec<Uuid> },
}

/// Mutation vocabulary over [`OutboxRecord`]s.
#[derive(Debug, Clone)]
pub enum OutboxUpdate {
    /// Claims rows atomically. The repository implementation MUST restrict
    /// this to rows that are still `claim_id IS NULL` or an expired-lease
    /// `Processing` row — the race fence two concurrent dequeues rely on.
    Claim {
        claim_id: Uuid,
        leased_until: DateTime<Utc>,
        now: DateTime<Utc>,
    },
    Complete { now: DateTime<Utc> },
    Fail {
        attempt_count: i32,
        next_attempt_on: DateTime<Utc>,
        error_message: String,
        now: DateTime<Utc>,
    },
}

impl Record for OutboxRecord {
    type Spec = OutboxSpec;
    type Update = OutboxUpdate;
}

/// Describes one failure to report through [`Outbox::fail`].
#[derive(Debug, Clone)]
pub struct FailedOutboxEvent {
    pub event_id: Uuid,
    pub error_message: String,
}

/// A claimed outbox event, decoded and ready to publish.
#[derive(Debug, Clone)]
pub struct ClaimedOutboxEvent<T> {
    pub event_id: Uuid,
    pub attempt_count: i32,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub payload: T,
}

pub struct Outbox<T, R, C>
where
    R: Repository<OutboxRecord>,
    C: Codec<T>,
{
    repo: Arc<R>,
    codec: Arc<C>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, R, C> Outbox<T, R, C>
where
    R: Repository<OutboxRecord>,
    C: Codec<T>,
{
    pub fn new(repo: R, codec: C) -> Self {
        Self {
            repo: Arc::new(repo),
            codec: Arc::new(codec),
            _marker: std::marker::PhantomData,
        }
    }

    /// Enqueues a batch of integration events, participating in whatever
    /// unit of work the caller's repository call is already inside.
    /// Non-integration events are silently dropped, mirroring the Event
    /// Store's `append_to_stream` family filtering.
    #[tracing::instrument(skip(self, events, cancel), fields(event_count = events.len()))]
    pub async fn enqueue(
        &self,
        events: Vec<Event<T>>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<Uuid>, OutboxError> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let envelopes: Vec<Envelope<T>> = events
            .into_iter()
            .filter_map(|event| match event {
                Event::Integration(envelope) => Some(envelope),
                _ => None,
            })
            .collect();

        if envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut assigned_ids = Vec::with_capacity(envelopes.len());
        let mut records = Vec::with_capacity(envelopes.len());

        for envelope in envelopes {
            let (event_name, payload) = self.codec.encode(&envelope.payload)?;
            let event_id = Uuid::new_v4();
            assigned_ids.push(event_id);

            records.push(OutboxRecord {
                event_id,
                event_name,
                payload,
                status: DeliveryStatus::Pending,
                attempt_count: 0,
                next_attempt_on: None,
                claim_id: None,
                error_message: None,
                correlation_id: envelope.correlation_id().map(str::to_string),
                causation_id: envelope.causation_id().map(str::to_string),
                // Assigned by the repository on commit.
                sequence: 0,
                created_on: now,
                updated_on: None,
            });
        }

        self.repo
            .insert(records, cancel)
            .await
            .map_err(RepositoryError::new)?;

        Ok(assigned_ids)
    }

    /// Claims up to `max` deliverable events for this worker. Rows claimed
    /// by a racing worker in between the candidate read and the claiming
    /// update are silently dropped from this batch.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn dequeue(
        &self,
        max: usize,
        visibility_timeout: Duration,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Vec<ClaimedOutboxEvent<T>>, OutboxError> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if max == 0 {
            return Err(InvalidArgument("dequeue max must be greater than zero".into()).into());
        }

        let now = Utc::now();
        let claim_id = Uuid::new_v4();
        let leased_until = now + visibility_timeout;

        let claimed = self
            .repo
            .bulk_update(
                OutboxSpec::Claimable { now, max_count: max },
                OutboxUpdate::Claim {
                    claim_id,
                    leased_until,
                    now,
                },
                cancel,
            )
            .await
            .map_err(RepositoryError::new)?;

        if claimed == 0 {
            return Ok(Vec::new());
        }

        let mut stream = self.repo.query(OutboxSpec::WithClaim { claim_id }, cancel);
        let mut out = Vec::new();

        use futures::StreamExt;
        while let Some(record) = stream.next().await {
            let record = record.map_err(RepositoryError::new)?;
            let payload = self.codec.decode(&record.event_name, &record.payload)?;
            out.push(ClaimedOutboxEvent {
                event_id: record.event_id,
                attempt_count: record.attempt_count,
                correlation_id: record.correlation_id,
                causation_id: record.causation_id,
                payload,
            });
        }

        Ok(out)
    }

    /// Marks `event_ids` as published, clearing their lease. `attempt_count`
    /// is left untouched.
    #[tracing::instrument(skip(self, event_ids, cancel), fields(event_count = event_ids.len()))]
    pub async fn complete(
        &self,
        event_ids: Vec<Uuid>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<u64, OutboxError> {
        if event_ids.is_empty() {
            return Err(InvalidArgument("complete requires at least one event id".into()).into());
        }

        self.repo
            .bulk_update(
                OutboxSpec::ById { event_ids },
                OutboxUpdate::Complete { now: Utc::now() },
                cancel,
            )
            .await
            .map_err(|err| RepositoryError::new(err).into())
    }

    /// Applies the exponential backoff schedule to each failure, one
    /// repository call per failure so a mid-batch crash does not orphan the
    /// rest of the batch.
    #[tracing::instrument(skip(self, failures, cancel), fields(failure_count = failures.len()))]
    pub async fn fail(
        &self,
        failures: Vec<FailedOutboxEvent>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), OutboxError> {
        if failures.is_empty() {
            return Err(InvalidArgument("fail requires at least one failure".into()).into());
        }

        for failure in failures {
            tracing::warn!(event_id = %failure.event_id, error = %failure.error_message, "outbox event delivery failed");
            let existing = self
                .repo
                .query_first(
                    OutboxSpec::ById {
                        event_ids: vec![failure.event_id],
                    },
                    cancel,
                )
                .await
                .map_err(RepositoryError::new)?;

            let attempt_count = existing.map_or(0, |record| record.attempt_count) + 1;
            let now = Utc::now();

            self.repo
                .bulk_update(
                    OutboxSpec::ById {
                        event_ids: vec![failure.event_id],
                    },
                    OutboxUpdate::Fail {
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

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use serde::{Deserialize, Serialize};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::codec::JsonCodec;
    use crate::event::Message;
    use crate::repository::RecordStream;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: String,
    }

    impl Message for OrderShipped {
        fn name(&self) -> &'static str {
            "OrderShipped"
        }
    }

    #[derive(Default)]
    struct InMemoryOutboxRepo {
        rows: Mutex<Vec<OutboxRecord>>,
        next_sequence: std::sync::atomic::AtomicI64,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("in-memory outbox repository error: {0}")]
    struct MemError(String);

    #[async_trait::async_trait]
    impl Repository<OutboxRecord> for InMemoryOutboxRepo {
        type Error = MemError;

        async fn insert(
            &self,
            batch: Vec<OutboxRecord>,
            _cancel: &CancellationToken,
        ) -> Result<(), Self::Error> {
            let mut rows = self.rows.lock().unwrap();
            for mut record in batch {
                record.sequence = self
                    .next_sequence
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                rows.push(record);
            }
            Ok(())
        }

        fn query(
            &self,
            spec: OutboxSpec,
            _cancel: &CancellationToken,
        ) -> RecordStream<'static, OutboxRecord, Self::Error> {
            let rows = self.rows.lock().unwrap().clone();
            let matched: Vec<_> = rows.into_iter().filter(|r| matches(&spec, r)).collect();
            Box::pin(stream::iter(matched.into_iter().map(Ok)))
        }

        async fn query_first(
            &self,
            spec: OutboxSpec,
            _cancel: &CancellationToken,
        ) -> Result<Option<OutboxRecord>, Self::Error> {
            let rows = self.rows.lock().unwrap().clone();
            Ok(rows.into_iter().find(|r| matches(&spec, r)))
        }

        async fn exists(
            &self,
            spec: OutboxSpec,
            _cancel: &CancellationToken,
        ) -> Result<bool, Self::Error> {
            let rows = self.rows.lock().unwrap().clone();
            Ok(rows.iter().any(|r| matches(&spec, r)))
        }

        async fn bulk_update(
            &self,
            spec: OutboxSpec,
            update: OutboxUpdate,
            _cancel: &CancellationToken,
        ) -> Result<u64, Self::Error> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0;

            if let OutboxSpec::Claimable { max_count, .. } = &spec {
                let mut candidate_ids: Vec<Uuid> = rows
                    .iter()
                    .filter(|r| matches(&spec, r))
                    .map(|r| r.event_id)
                    .collect();
                candidate_ids.truncate(*max_count);

                for record in rows.iter_mut() {
                    if candidate_ids.contains(&record.event_id) {
                        apply(record, &update);
                        count += 1;
                    }
                }
                return Ok(count);
            }

            for record in rows.iter_mut() {
                if matches(&spec, record) {
                    apply(record, &update);
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn delete(
            &self,
            spec: OutboxSpec,
            _cancel: &CancellationToken,
        ) -> Result<u64, Self::Error> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| !matches(&spec, r));
            Ok((before - rows.len()) as u64)
        }
    }

    fn matches(spec: &OutboxSpec, record: &OutboxRecord) -> bool {
        match spec {
            OutboxSpec::Claimable { now, .. } => match record.status {
                DeliveryStatus::Pending => record.claim_id.is_none(),
                DeliveryStatus::OnError => {
                    record.claim_id.is_none()
                        && record.next_attempt_on.map_or(true, |at| at <= *now)
                }
                DeliveryStatus::Processing => {
                    record.next_attempt_on.map_or(false, |at| at <= *now)
                }
                DeliveryStatus::Published => false,
            },
            OutboxSpec::WithClaim { claim_id } => record.claim_id == Some(*claim_id),
            OutboxSpec::ById { event_ids } => event_ids.contains(&record.event_id),
        }
    }

    fn apply(record: &mut OutboxRecord, update: &OutboxUpdate) {
        match update.clone() {
            OutboxUpdate::Claim {
                claim_id,
                leased_until,
                now,
            } => {
                record.status = DeliveryStatus::Processing;
                record.claim_id = Some(claim_id);
                record.next_attempt_on = Some(leased_until);
                record.updated_on = Some(now);
            }
            OutboxUpdate::Complete { now } => {
                record.status = DeliveryStatus::Published;
                record.claim_id = None;
                record.next_attempt_on = None;
                record.error_message = None;
                record.updated_on = Some(now);
            }
            OutboxUpdate::Fail {
                attempt_count,
                next_attempt_on,
                error_message,
                now,
            } => {
                record.status = DeliveryStatus::OnError;
                record.attempt_count = attempt_count;
                record.claim_id = None;
                record.next_attempt_on = Some(next_attempt_on);
                record.error_message = Some(error_message);
                record.updated_on = Some(now);
            }
        }
    }

    fn new_outbox() -> Outbox<OrderShipped, InMemoryOutboxRepo, JsonCodec<OrderShipped>> {
        Outbox::new(InMemoryOutboxRepo::default(), JsonCodec::default())
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_claims_pending_rows() {
        let outbox = new_outbox();
        let cancel = CancellationToken::new();

        outbox
            .enqueue(
                vec![Event::Integration(
                    OrderShipped {
                        order_id: "o-1".into(),
                    }
                    .into(),
                )],
                &cancel,
            )
            .await
            .unwrap();

        let claimed = outbox
            .dequeue(10, Duration::minutes(5), &cancel)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload.order_id, "o-1");
        assert_eq!(claimed[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn dequeue_does_not_reclaim_an_active_lease() {
        let outbox = new_outbox();
        let cancel = CancellationToken::new();

        outbox
            .enqueue(
                vec![Event::Integration(
                    OrderShipped {
                        order_id: "o-1".into(),
                    }
                    .into(),
                )],
                &cancel,
            )
            .await
            .unwrap();

        let first = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn complete_clears_the_lease() {
        let outbox = new_outbox();
        let cancel = CancellationToken::new();

        outbox
            .enqueue(
                vec![Event::Integration(
                    OrderShipped {
                        order_id: "o-1".into(),
                    }
                    .into(),
                )],
                &cancel,
            )
            .await
            .unwrap();

        let claimed = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        let event_id = claimed[0].event_id;

        let affected = outbox.complete(vec![event_id], &cancel).await.unwrap();
        assert_eq!(affected, 1);

        let redequeued = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        assert!(redequeued.is_empty());
    }

    #[tokio::test]
    async fn fail_schedules_a_retry_with_backoff() {
        let outbox = new_outbox();
        let cancel = CancellationToken::new();

        outbox
            .enqueue(
                vec![Event::Integration(
                    OrderShipped {
                        order_id: "o-1".into(),
                    }
                    .into(),
                )],
                &cancel,
            )
            .await
            .unwrap();

        let claimed = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        let event_id = claimed[0].event_id;

        outbox
            .fail(
                vec![FailedOutboxEvent {
                    event_id,
                    error_message: "publish timed out".into(),
                }],
                &cancel,
            )
            .await
            .unwrap();

        // Not yet eligible: the row is ONERROR with next_attempt_on ~10s out.
        let immediate = outbox.dequeue(10, Duration::minutes(5), &cancel).await.unwrap();
        assert!(immediate.is_empty());
    }
}
