//! Persisted entities. These are the rows the [`crate::repository::Repository`]
//! port moves in and out of storage; callers never construct or mutate them
//! directly, only through `EventStore`/`Outbox`/`Inbox` operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a [`DomainEventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainEventStatus {
    Active,
    Deleted,
}

/// A single committed domain event, scoped to a stream.
///
/// Invariants: unique on `(stream_id, stream_version)`; `sequence` is
/// strictly increasing in commit order across every stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEventRecord {
    pub event_id: Uuid,
    pub stream_id: Uuid,
    pub stream_name: String,
    pub stream_version: i64,
    pub sequence: i64,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub status: DomainEventStatus,
    pub created_on: DateTime<Utc>,
    pub updated_on: Option<DateTime<Utc>>,
    pub deleted_on: Option<DateTime<Utc>>,
}

/// A materialized aggregate snapshot, advisory only: never a substitute for
/// the event log, and never affects `stream_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub event_id: Uuid,
    pub owner_id: Uuid,
    pub sequence: i64,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub created_on: DateTime<Utc>,
}

/// Status shared by [`OutboxRecord`] and [`InboxRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Processing,
    Published,
    OnError,
}

/// An outbound integration event awaiting publication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: Uuid,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub next_attempt_on: Option<DateTime<Utc>>,
    pub claim_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub sequence: i64,
    pub created_on: DateTime<Utc>,
    pub updated_on: Option<DateTime<Utc>>,
}

/// An inbound integration event, keyed by `(event_id, consumer)` for
/// exactly-once handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxRecord {
    pub event_id: Uuid,
    pub consumer: String,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub status: DeliveryStatus,
    pub attempt_count: i32,
    pub next_attempt_on: Option<DateTime<Utc>>,
    pub claim_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub created_on: DateTime<Utc>,
    pub updated_on: Option<DateTime<Utc>>,
}
