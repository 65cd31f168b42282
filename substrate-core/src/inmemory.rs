//! An in-process [`Repository`] implementation, backed by a `std::sync::RwLock<Vec<T>>`.
//!
//! Intended for unit tests and single-process prototypes; `substrate-postgres`
//! is the durable, multi-process implementation. Every `query*`/`exists`
//! evaluation is a full linear scan, which is fine at test-fixture scale and
//! deliberately not optimized further.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Cancelled;
use crate::inbox::{InboxSpec, InboxUpdate};
use crate::records::{DeliveryStatus, DomainEventStatus, InboxRecord, OutboxRecord};
use crate::records::{DomainEventRecord, SnapshotRecord};
use crate::repository::{RecordStream, Repository};
use crate::store::{DomainEventSpec, DomainEventUpdate, SnapshotSpec};
use crate::outbox::{OutboxSpec, OutboxUpdate};

#[derive(Debug, thiserror::Error)]
#[error("in-memory repository error: {0}")]
pub struct InMemoryError(String);

impl From<Cancelled> for InMemoryError {
    fn from(_: Cancelled) -> Self {
        InMemoryError("operation was cancelled".to_string())
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), InMemoryError> {
    if cancel.is_cancelled() {
        return Err(Cancelled.into());
    }
    Ok(())
}

/// Generic backing store shared by every entity-specific repository below.
struct Table<T> {
    rows: RwLock<Vec<T>>,
    next_sequence: AtomicI64,
}

impl<T: Clone> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            next_sequence: AtomicI64::new(0),
        }
    }
}

impl<T: Clone> Table<T> {
    fn next_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

/// In-memory [`Repository`] for [`DomainEventRecord`]s.
#[derive(Default)]
pub struct InMemoryEventRepository {
    table: Table<DomainEventRecord>,
}

fn domain_event_matches(record: &DomainEventRecord, spec: &DomainEventSpec) -> bool {
    match spec {
        DomainEventSpec::StreamFrom {
            stream_id,
            from_version,
            ..
        } => {
            record.stream_id == *stream_id
                && record.stream_version > *from_version
                && record.status == DomainEventStatus::Active
        }
        DomainEventSpec::AllFrom { from_position, .. } => {
            record.sequence > *from_position && record.status == DomainEventStatus::Active
        }
        DomainEventSpec::LatestActiveForStream { stream_id } => {
            record.stream_id == *stream_id && record.status == DomainEventStatus::Active
        }
        DomainEventSpec::AnyForStream { stream_id } => record.stream_id == *stream_id,
    }
}

fn domain_event_ordered(mut rows: Vec<DomainEventRecord>, spec: &DomainEventSpec) -> Vec<DomainEventRecord> {
    match spec {
        DomainEventSpec::StreamFrom { max_count, .. } => {
            rows.sort_by_key(|r| r.stream_version);
            rows.truncate(*max_count);
        }
        DomainEventSpec::AllFrom { max_count, .. } => {
            rows.sort_by_key(|r| r.sequence);
            rows.truncate(*max_count);
        }
        DomainEventSpec::LatestActiveForStream { .. } => {
            rows.sort_by_key(|r| std::cmp::Reverse(r.stream_version));
            rows.truncate(1);
        }
        DomainEventSpec::AnyForStream { .. } => {}
    }
    rows
}

#[async_trait]
impl Repository<DomainEventRecord> for InMemoryEventRepository {
    type Error = InMemoryError;

    async fn insert(
        &self,
        batch: Vec<DomainEventRecord>,
        cancel: &CancellationToken,
    ) -> Result<(), Self::Error> {
        check_cancelled(cancel)?;
        let mut rows = self.table.rows.write().unwrap();

        for mut record in batch.into_iter() {
            let conflict = rows.iter().any(|existing| {
                existing.stream_id == record.stream_id
                    && existing.stream_version == record.stream_version
                    && existing.status == DomainEventStatus::Active
            });
            if conflict {
                return Err(InMemoryError(
                    "unique violation on (stream_id, stream_version)".to_string(),
                ));
            }
            record.sequence = self.table.next_sequence();
            rows.push(record);
        }
        Ok(())
    }

    fn query(
        &self,
        spec: DomainEventSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, DomainEventRecord, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        let matched = domain_event_ordered(
            rows.into_iter().filter(|r| domain_event_matches(r, &spec)).collect(),
            &spec,
        );
        Box::pin(stream::iter(matched.into_iter().map(Ok)))
    }

    async fn query_first(
        &self,
        spec: DomainEventSpec,
        _cancel: &CancellationToken,
    ) -> Result<Option<DomainEventRecord>, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        let matched = domain_event_ordered(
            rows.into_iter().filter(|r| domain_event_matches(r, &spec)).collect(),
            &spec,
        );
        Ok(matched.into_iter().next())
    }

    async fn exists(
        &self,
        spec: DomainEventSpec,
        _cancel: &CancellationToken,
    ) -> Result<bool, Self::Error> {
        let rows = self.table.rows.read().unwrap();
        Ok(rows.iter().any(|r| domain_event_matches(r, &spec)))
    }

    async fn bulk_update(
        &self,
        spec: DomainEventSpec,
        update: DomainEventUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();
        let mut count = 0;
        for record in rows.iter_mut() {
            if domain_event_matches(record, &spec) {
                match update {
                    DomainEventUpdate::SoftDelete { deleted_on } => {
                        record.status = DomainEventStatus::Deleted;
                        record.deleted_on = Some(deleted_on);
                    }
                    DomainEventUpdate::Undelete => {
                        record.status = DomainEventStatus::Active;
                        record.deleted_on = None;
                    }
                }
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, spec: DomainEventSpec, _cancel: &CancellationToken) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();
        let before = rows.len();
        rows.retain(|r| !domain_event_matches(r, &spec));
        Ok((before - rows.len()) as u64)
    }
}

/// In-memory [`Repository`] for [`SnapshotRecord`]s.
#[derive(Default)]
pub struct InMemorySnapshotRepository {
    table: Table<SnapshotRecord>,
}

#[async_trait]
impl Repository<SnapshotRecord> for InMemorySnapshotRepository {
    type Error = InMemoryError;

    async fn insert(&self, batch: Vec<SnapshotRecord>, cancel: &CancellationToken) -> Result<(), Self::Error> {
        check_cancelled(cancel)?;
        let mut rows = self.table.rows.write().unwrap();
        for mut record in batch.into_iter() {
            record.sequence = self.table.next_sequence();
            rows.push(record);
        }
        Ok(())
    }

    fn query(
        &self,
        spec: SnapshotSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, SnapshotRecord, Self::Error> {
        let SnapshotSpec::LatestForOwner { owner_id } = spec;
        let rows = self.table.rows.read().unwrap().clone();
        let matched: Vec<_> = rows.into_iter().filter(|r| r.owner_id == owner_id).collect();
        Box::pin(stream::iter(matched.into_iter().map(Ok)))
    }

    async fn query_first(
        &self,
        spec: SnapshotSpec,
        _cancel: &CancellationToken,
    ) -> Result<Option<SnapshotRecord>, Self::Error> {
        let SnapshotSpec::LatestForOwner { owner_id } = spec;
        let rows = self.table.rows.read().unwrap().clone();
        Ok(rows.into_iter().filter(|r| r.owner_id == owner_id).max_by_key(|r| r.sequence))
    }

    async fn exists(&self, spec: SnapshotSpec, cancel: &CancellationToken) -> Result<bool, Self::Error> {
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

    async fn delete(&self, spec: SnapshotSpec, _cancel: &CancellationToken) -> Result<u64, Self::Error> {
        let SnapshotSpec::LatestForOwner { owner_id } = spec;
        let mut rows = self.table.rows.write().unwrap();
        let before = rows.len();
        rows.retain(|r| r.owner_id != owner_id);
        Ok((before - rows.len()) as u64)
    }
}

fn outbox_claimable(record: &OutboxRecord, now: chrono::DateTime<chrono::Utc>) -> bool {
    match record.status {
        DeliveryStatus::Pending => record.claim_id.is_none(),
        DeliveryStatus::OnError => {
            record.claim_id.is_none() && record.next_attempt_on.map_or(true, |at| at <= now)
        }
        DeliveryStatus::Processing => record.next_attempt_on.map_or(false, |at| at <= now),
        DeliveryStatus::Published => false,
    }
}

fn outbox_matches(record: &OutboxRecord, spec: &OutboxSpec) -> bool {
    match spec {
        OutboxSpec::Claimable { now, .. } => outbox_claimable(record, *now),
        OutboxSpec::WithClaim { claim_id } => record.claim_id == Some(*claim_id),
        OutboxSpec::ById { event_ids } => event_ids.contains(&record.event_id),
    }
}

fn apply_outbox_update(record: &mut OutboxRecord, update: &OutboxUpdate) {
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

/// In-memory [`Repository`] for [`OutboxRecord`]s. The claiming
/// `bulk_update` is serialized behind the table's write lock, which is the
/// in-process analogue of the guarded `UPDATE ... WHERE` race fence the
/// Postgres implementation uses.
#[derive(Default)]
pub struct InMemoryOutboxRepository {
    table: Table<OutboxRecord>,
}

#[async_trait]
impl Repository<OutboxRecord> for InMemoryOutboxRepository {
    type Error = InMemoryError;

    async fn insert(&self, batch: Vec<OutboxRecord>, cancel: &CancellationToken) -> Result<(), Self::Error> {
        check_cancelled(cancel)?;
        let mut rows = self.table.rows.write().unwrap();
        for mut record in batch.into_iter() {
            record.sequence = self.table.next_sequence();
            rows.push(record);
        }
        Ok(())
    }

    fn query(
        &self,
        spec: OutboxSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, OutboxRecord, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        let mut matched: Vec<_> = rows.into_iter().filter(|r| outbox_matches(r, &spec)).collect();
        matched.sort_by_key(|r| r.sequence);
        Box::pin(stream::iter(matched.into_iter().map(Ok)))
    }

    async fn query_first(
        &self,
        spec: OutboxSpec,
        _cancel: &CancellationToken,
    ) -> Result<Option<OutboxRecord>, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        Ok(rows.into_iter().filter(|r| outbox_matches(r, &spec)).min_by_key(|r| r.sequence))
    }

    async fn exists(&self, spec: OutboxSpec, _cancel: &CancellationToken) -> Result<bool, Self::Error> {
        let rows = self.table.rows.read().unwrap();
        Ok(rows.iter().any(|r| outbox_matches(r, &spec)))
    }

    async fn bulk_update(
        &self,
        spec: OutboxSpec,
        update: OutboxUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();

        if let OutboxSpec::Claimable { max_count, .. } = &spec {
            let mut candidate_ids: Vec<Uuid> = rows
                .iter()
                .filter(|r| outbox_matches(r, &spec))
                .map(|r| r.event_id)
                .collect();
            candidate_ids.sort();
            candidate_ids.truncate(*max_count);

            let mut count = 0;
            for record in rows.iter_mut() {
                if candidate_ids.contains(&record.event_id) {
                    apply_outbox_update(record, &update);
                    count += 1;
                }
            }
            return Ok(count);
        }

        let mut count = 0;
        for record in rows.iter_mut() {
            if outbox_matches(record, &spec) {
                apply_outbox_update(record, &update);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, spec: OutboxSpec, _cancel: &CancellationToken) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();
        let before = rows.len();
        rows.retain(|r| !outbox_matches(r, &spec));
        Ok((before - rows.len()) as u64)
    }
}

fn inbox_key_matches(record: &InboxRecord, event_id: Uuid, consumer: &str) -> bool {
    record.event_id == event_id && record.consumer == consumer
}

fn inbox_matches(record: &InboxRecord, spec: &InboxSpec) -> bool {
    match spec {
        InboxSpec::ByKey { event_id, consumer } => inbox_key_matches(record, *event_id, consumer),
        InboxSpec::ByKeys { keys } => keys
            .iter()
            .any(|(event_id, consumer)| inbox_key_matches(record, *event_id, consumer)),
    }
}

fn apply_inbox_update(record: &mut InboxRecord, update: &InboxUpdate) {
    match update.clone() {
        InboxUpdate::Complete { now } => {
            record.status = DeliveryStatus::Published;
            record.claim_id = None;
            record.next_attempt_on = None;
            record.error_message = None;
            record.updated_on = Some(now);
        }
        InboxUpdate::Fail {
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
        InboxUpdate::Release {
            claim_id,
            leased_until,
            now,
        } => {
            record.status = DeliveryStatus::Processing;
            record.claim_id = Some(claim_id);
            record.next_attempt_on = Some(leased_until);
            record.updated_on = Some(now);
        }
    }
}

/// In-memory [`Repository`] for [`InboxRecord`]s.
#[derive(Default)]
pub struct InMemoryInboxRepository {
    table: Table<InboxRecord>,
}

#[async_trait]
impl Repository<InboxRecord> for InMemoryInboxRepository {
    type Error = InMemoryError;

    async fn insert(&self, batch: Vec<InboxRecord>, cancel: &CancellationToken) -> Result<(), Self::Error> {
        check_cancelled(cancel)?;
        let mut rows = self.table.rows.write().unwrap();
        for record in batch.into_iter() {
            if rows
                .iter()
                .any(|r| inbox_key_matches(r, record.event_id, &record.consumer))
            {
                return Err(InMemoryError("duplicate (event_id, consumer)".to_string()));
            }
            rows.push(record);
        }
        Ok(())
    }

    fn query(
        &self,
        spec: InboxSpec,
        _cancel: &CancellationToken,
    ) -> RecordStream<'static, InboxRecord, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        let matched: Vec<_> = rows.into_iter().filter(|r| inbox_matches(r, &spec)).collect();
        Box::pin(stream::iter(matched.into_iter().map(Ok)))
    }

    async fn query_first(
        &self,
        spec: InboxSpec,
        _cancel: &CancellationToken,
    ) -> Result<Option<InboxRecord>, Self::Error> {
        let rows = self.table.rows.read().unwrap().clone();
        Ok(rows.into_iter().find(|r| inbox_matches(r, &spec)))
    }

    async fn exists(&self, spec: InboxSpec, _cancel: &CancellationToken) -> Result<bool, Self::Error> {
        let rows = self.table.rows.read().unwrap();
        Ok(rows.iter().any(|r| inbox_matches(r, &spec)))
    }

    async fn bulk_update(
        &self,
        spec: InboxSpec,
        update: InboxUpdate,
        _cancel: &CancellationToken,
    ) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();
        let mut count = 0;
        for record in rows.iter_mut() {
            if inbox_matches(record, &spec) {
                apply_inbox_update(record, &update);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete(&self, spec: InboxSpec, _cancel: &CancellationToken) -> Result<u64, Self::Error> {
        let mut rows = self.table.rows.write().unwrap();
        let before = rows.len();
        rows.retain(|r| !inbox_matches(r, &spec));
        Ok((before - rows.len()) as u64)
    }
}
