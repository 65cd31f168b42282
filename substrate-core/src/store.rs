//! The Event Store: per-stream append-only log, global sequence, and the
//! advisory snapshot sidecar.
//!
//! Generic over the repository backing the two entities it persists
//! ([`crate::records::DomainEventRecord`] and [`crate::records::SnapshotRecord`])
//! and the [`Codec`] used to move between `T` and the bytes a record stores.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::Codec;
use crate::error::{
    Cancelled, ConcurrencyConflict, RepositoryError, StoreError, StreamDeleted,
    SubscriptionError,
};
use crate::event::{Envelope, Event, PersistedEnvelope, VersionSelect};
use crate::records::{DomainEventRecord, DomainEventStatus, SnapshotRecord};
use crate::repository::{Record, Repository};
use crate::subscription::{self, OnEvent, Subscription};

/// Query vocabulary over [`DomainEventRecord`]s.
#[derive(Debug, Clone)]
pub enum DomainEventSpec {
    /// Active events of one stream, from `from_version` (exclusive) onward,
    /// ordered by `stream_version`, capped at `max_count`.
    StreamFrom {
        stream_id: Uuid,
        from_version: i64,
        max_count: usize,
    },
    /// Every event across every stream, from `from_position` (exclusive)
    /// onward, ordered by `sequence`, capped at `max_count`.
    AllFrom {
        from_position: i64,
        max_count: usize,
    },
    /// The highest-`stream_version` active event of a stream, if any.
    LatestActiveForStream { stream_id: Uuid },
    /// Every event of a stream regardless of status, used to distinguish "no
    /// such stream" from "stream exists but is soft-deleted".
    AnyForStream { stream_id: Uuid },
}

/// Mutation vocabulary over [`DomainEventRecord`]s.
#[derive(Debug, Clone, Copy)]
pub enum DomainEventUpdate {
    SoftDelete { deleted_on: chrono::DateTime<Utc> },
    Undelete,
}

impl Record for DomainEventRecord {
    type Spec = DomainEventSpec;
    type Update = DomainEventUpdate;
}

/// Query vocabulary over [`SnapshotRecord`]s. There is no `Update`: a
/// snapshot is replaced wholesale via `insert`, never mutated in place.
#[derive(Debug, Clone)]
pub enum SnapshotSpec {
    LatestForOwner { owner_id: Uuid },
}

impl Record for SnapshotRecord {
    type Spec = SnapshotSpec;
    type Update = std::convert::Infallible;
}

/// Outcome of a successful [`EventStore::append_to_stream`] call.
#[derive(Debug, Clone)]
pub struct AppendResult {
    pub assigned_ids: Vec<Uuid>,
    /// The stream's version before this append (-1 for a brand-new stream).
    pub prior_version: i64,
    /// The stream's version after this append.
    pub next_version: i64,
}

const DEFAULT_READ_BATCH: usize = 1000;

/// Persists domain events and advisory snapshots, and hosts the polling
/// subscription loops that read them back.
pub struct EventStore<T, DomainRepo, SnapRepo, C>
where
    DomainRepo: Repository<DomainEventRecord>,
    SnapRepo: Repository<SnapshotRecord>,
    C: Codec<T>,
{
    domain_repo: Arc<DomainRepo>,
    snapshot_repo: Arc<SnapRepo>,
    codec: Arc<C>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, DomainRepo, SnapRepo, C> Clone for EventStore<T, DomainRepo, SnapRepo, C>
where
    DomainRepo: Repository<DomainEventRecord>,
    SnapRepo: Repository<SnapshotRecord>,
    C: Codec<T>,
{
    fn clone(&self) -> Self {
        Self {
            domain_repo: Arc::clone(&self.domain_repo),
            snapshot_repo: Arc::clone(&self.snapshot_repo),
            codec: Arc::clone(&self.codec),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, DomainRepo, SnapRepo, C> EventStore<T, DomainRepo, SnapRepo, C>
where
    T: Send + Sync + 'static,
    DomainRepo: Repository<DomainEventRecord> + 'static,
    SnapRepo: Repository<SnapshotRecord> + 'static,
    C: Codec<T> + 'static,
{
    pub fn new(domain_repo: DomainRepo, snapshot_repo: SnapRepo, codec: C) -> Self {
        Self {
            domain_repo: Arc::new(domain_repo),
            snapshot_repo: Arc::new(snapshot_repo),
            codec: Arc::new(codec),
            _marker: std::marker::PhantomData,
        }
    }

    /// Returns the stream's current version, or `-1` if it has no active
    /// events (either it never existed, or it was soft-deleted).
    #[tracing::instrument(skip(self, cancel))]
    pub async fn stream_version(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        let latest = self
            .domain_repo
            .query_first(
                DomainEventSpec::LatestActiveForStream { stream_id },
                cancel,
            )
            .await
            .map_err(|err| StoreError::from(RepositoryError::new(err)))?;

        Ok(latest.map_or(-1, |record| record.stream_version))
    }

    /// Returns whether `stream_id` has any active events.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn stream_exists(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        Ok(self.stream_version(stream_id, cancel).await? >= 0)
    }

    /// `None` means the stream has never had any record at all; `Some(true)`
    /// means it currently has only soft-deleted records.
    async fn is_soft_deleted(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        if self.stream_version(stream_id, cancel).await? >= 0 {
            return Ok(false);
        }

        self.domain_repo
            .exists(DomainEventSpec::AnyForStream { stream_id }, cancel)
            .await
            .map_err(|err| StoreError::from(RepositoryError::new(err)))
    }

    /// Appends `events` to `stream_id`, enforcing `expected_version` as an
    /// optimistic concurrency check.
    ///
    /// `expected_version` of `None` means "append regardless of the current
    /// version"; `Some(-1)` means "this must be a brand-new stream".
    /// Non-domain events in `events` (snapshots, integration events) are
    /// silently dropped from the batch — this is the one place a caller can
    /// hand the store a mixed [`Event`] batch and have it sort itself out.
    #[tracing::instrument(skip(self, events, cancel), fields(event_count = events.len()))]
    pub async fn append_to_stream(
        &self,
        stream_id: Uuid,
        stream_name: impl Into<String>,
        events: Vec<Event<T>>,
        expected_version: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<AppendResult, StoreError> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let stream_name = stream_name.into();
        let envelopes: Vec<Envelope<T>> = events.into_iter().filter_map(Event::into_domain).collect();

        if envelopes.is_empty() {
            let prior = expected_version.unwrap_or(-1);
            return Ok(AppendResult {
                assigned_ids: Vec::new(),
                prior_version: prior,
                next_version: prior + 1,
            });
        }

        if self.is_soft_deleted(stream_id, cancel).await? {
            tracing::warn!(%stream_id, "append rejected: stream is soft-deleted");
            return Err(StreamDeleted { stream_id }.into());
        }

        let current_version = self.stream_version(stream_id, cancel).await?;

        if let Some(expected) = expected_version {
            if expected != current_version {
                tracing::warn!(%stream_id, expected, actual = current_version, "optimistic concurrency check failed");
                return Err(ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual: current_version,
                }
                .into());
            }
        }

        let now = Utc::now();
        let mut assigned_ids = Vec::with_capacity(envelopes.len());
        let mut records = Vec::with_capacity(envelopes.len());

        for (offset, envelope) in envelopes.into_iter().enumerate() {
            let (event_name, payload) = self.codec.encode(&envelope.payload)?;
            let event_id = Uuid::new_v4();
            assigned_ids.push(event_id);

            records.push(DomainEventRecord {
                event_id,
                stream_id,
                stream_name: stream_name.clone(),
                stream_version: current_version + 1 + offset as i64,
                // Assigned by the repository on commit, so the global order
                // matches commit order rather than append-call order.
                sequence: 0,
                event_name,
                payload,
                causation_id: envelope.causation_id().map(str::to_string),
                correlation_id: envelope.correlation_id().map(str::to_string),
                status: DomainEventStatus::Active,
                created_on: now,
                updated_on: None,
                deleted_on: None,
            });
        }

        let next_version = current_version + assigned_ids.len() as i64;

        if self.domain_repo.insert(records, cancel).await.is_err() {
            // The version check above is advisory; the repository's unique
            // constraint on (stream_id, stream_version) is the actual race
            // fence for two concurrent appends racing past it.
            let actual = self
                .stream_version(stream_id, cancel)
                .await
                .unwrap_or(current_version);
            tracing::warn!(%stream_id, expected = current_version, actual, "concurrent append lost the race to the unique constraint");
            return Err(ConcurrencyConflict {
                stream_id,
                expected: current_version,
                actual,
            }
            .into());
        }

        Ok(AppendResult {
            assigned_ids,
            prior_version: current_version,
            next_version,
        })
    }

    fn decode(&self, record: DomainEventRecord) -> Result<PersistedEnvelope<T>, StoreError> {
        let payload = self.codec.decode(&record.event_name, &record.payload)?;

        Ok(PersistedEnvelope {
            event_id: record.event_id,
            event_name: record.event_name,
            stream_id: record.stream_id,
            stream_name: record.stream_name,
            stream_version: record.stream_version,
            sequence: record.sequence,
            occurred_on: record.created_on,
            causation_id: record.causation_id,
            correlation_id: record.correlation_id,
            payload,
        })
    }

    /// Reads one stream's active events, oldest first.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn read_stream(
        &self,
        stream_id: Uuid,
        select: VersionSelect,
        cancel: &CancellationToken,
    ) -> Result<Vec<PersistedEnvelope<T>>, StoreError> {
        let from_version = match select {
            VersionSelect::All => -1,
            VersionSelect::From(version) => version,
        };

        let spec = DomainEventSpec::StreamFrom {
            stream_id,
            from_version,
            max_count: DEFAULT_READ_BATCH,
        };

        self.collect(spec, cancel).await
    }

    /// Reads the global log, oldest first.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn read_all(
        &self,
        select: VersionSelect,
        cancel: &CancellationToken,
    ) -> Result<Vec<PersistedEnvelope<T>>, StoreError> {
        let from_position = match select {
            VersionSelect::All => -1,
            VersionSelect::From(position) => position,
        };

        let spec = DomainEventSpec::AllFrom {
            from_position,
            max_count: DEFAULT_READ_BATCH,
        };

        self.collect(spec, cancel).await
    }

    async fn collect(
        &self,
        spec: DomainEventSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<PersistedEnvelope<T>>, StoreError> {
        let mut stream = self.domain_repo.query(spec, cancel);
        let mut out = Vec::new();

        while let Some(record) = stream.next().await {
            let record = record.map_err(|err| StoreError::from(RepositoryError::new(err)))?;
            out.push(self.decode(record)?);
        }

        Ok(out)
    }

    /// Soft-deletes every active event of `stream_id`. A no-op (not an
    /// error) if the stream has no active events.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn delete_stream(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        self.domain_repo
            .bulk_update(
                DomainEventSpec::AnyForStream { stream_id },
                DomainEventUpdate::SoftDelete {
                    deleted_on: Utc::now(),
                },
                cancel,
            )
            .await
            .map_err(|err| RepositoryError::new(err).into())
    }

    /// Reverses [`EventStore::delete_stream`], restoring every event of
    /// `stream_id` to `Active` so appends and reads resume normally.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn undelete_stream(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        self.domain_repo
            .bulk_update(
                DomainEventSpec::AnyForStream { stream_id },
                DomainEventUpdate::Undelete,
                cancel,
            )
            .await
            .map_err(|err| RepositoryError::new(err).into())
    }

    /// Permanently removes every event of `stream_id`, active or deleted.
    /// Unlike `delete_stream`, this cannot be undone.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn truncate_stream(
        &self,
        stream_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        self.domain_repo
            .delete(DomainEventSpec::AnyForStream { stream_id }, cancel)
            .await
            .map_err(|err| RepositoryError::new(err).into())
    }

    /// Records a new snapshot for `owner_id`. Snapshots are advisory: a
    /// reader must be prepared for `latest_snapshot` to return `None` or a
    /// stale snapshot and fall back to `read_stream`.
    #[tracing::instrument(skip(self, snapshot, cancel))]
    pub async fn append_snapshot(
        &self,
        owner_id: Uuid,
        snapshot: Envelope<T>,
        cancel: &CancellationToken,
    ) -> Result<Uuid, StoreError> {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        let (event_name, payload) = self.codec.encode(&snapshot.payload)?;
        let event_id = Uuid::new_v4();

        let record = SnapshotRecord {
            event_id,
            owner_id,
            sequence: 0,
            event_name,
            payload,
            created_on: Utc::now(),
        };

        self.snapshot_repo
            .insert(vec![record], cancel)
            .await
            .map_err(RepositoryError::new)?;

        Ok(event_id)
    }

    /// Returns the most recently recorded snapshot for `owner_id`, if any.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn latest_snapshot(
        &self,
        owner_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<PersistedEnvelope<T>>, StoreError> {
        let record = self
            .snapshot_repo
            .query_first(SnapshotSpec::LatestForOwner { owner_id }, cancel)
            .await
            .map_err(RepositoryError::new)?;

        record
            .map(|record| {
                let payload = self.codec.decode(&record.event_name, &record.payload)?;
                Ok(PersistedEnvelope {
                    event_id: record.event_id,
                    event_name: record.event_name,
                    stream_id: owner_id,
                    stream_name: String::new(),
                    stream_version: 0,
                    sequence: record.sequence,
                    occurred_on: record.created_on,
                    causation_id: None,
                    correlation_id: None,
                    payload,
                })
            })
            .transpose()
    }

    /// Starts a polling subscription over one stream, from `from_version`
    /// (exclusive) onward. The returned [`Subscription`] must be kept alive
    /// for as long as delivery should continue.
    pub fn subscribe_stream(
        &self,
        stream_id: Uuid,
        from_version: i64,
        polling_interval: std::time::Duration,
        on_event: OnEvent<T>,
    ) -> Subscription {
        let store = self.clone();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            subscription::run(
                from_version,
                polling_interval,
                on_event,
                |envelope| envelope.stream_version,
                move |after| {
                    let store = store.clone();
                    async move {
                        store
                            .collect(
                                DomainEventSpec::StreamFrom {
                                    stream_id,
                                    from_version: after,
                                    max_count: subscription::DEFAULT_SUBSCRIPTION_BATCH,
                                },
                                &CancellationToken::new(),
                            )
                            .await
                    }
                },
                loop_cancel,
            )
            .await
        });

        Subscription::new(cancel, handle)
    }

    /// Starts a polling subscription over the global log, from
    /// `from_position` (exclusive) onward.
    pub fn subscribe_all(
        &self,
        from_position: i64,
        polling_interval: std::time::Duration,
        on_event: OnEvent<T>,
    ) -> Subscription {
        let store = self.clone();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            subscription::run(
                from_position,
                polling_interval,
                on_event,
                |envelope| envelope.sequence,
                move |after| {
                    let store = store.clone();
                    async move {
                        store
                            .collect(
                                DomainEventSpec::AllFrom {
                                    from_position: after,
                                    max_count: subscription::DEFAULT_SUBSCRIPTION_BATCH,
                                },
                                &CancellationToken::new(),
                            )
                            .await
                    }
                },
                loop_cancel,
            )
            .await
        });

        Subscription::new(cancel, handle)
    }
}
