//! Domain types for in-memory events, as opposed to their persisted
//! [`crate::records`] representation.
//!
//! [`Event`] enumerates the three families a caller can hand to the store
//! (domain / snapshot / integration) as a tagged sum, so `append_to_stream`
//! can filter down to the `Domain` variant without any runtime reflection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A piece of domain data carried by an [`Envelope`]. Each message exposes a
/// stable name used both for wire-format type resolution and for logging.
pub trait Message: Send + Sync {
    fn name(&self) -> &'static str;
}

/// Free-form context attached to an event: correlation/causation ids,
/// trace ids, or anything else a producer wants to carry alongside the payload.
pub type Metadata = HashMap<String, String>;

/// A [`Message`] packaged with its [`Metadata`], ready to be handed to the
/// Event Store, Outbox or Inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub payload: T,
    pub metadata: Metadata,
}

impl<T> From<T> for Envelope<T> {
    fn from(payload: T) -> Self {
        Self {
            payload,
            metadata: Metadata::default(),
        }
    }
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get("correlation_id").map(String::as_str)
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.metadata.get("causation_id").map(String::as_str)
    }
}

/// Tags an [`Envelope`] with the family it belongs to, mirroring the three
/// record kinds the substrate persists (domain events, snapshots, integration
/// events headed for the outbox/inbox).
#[derive(Debug, Clone)]
pub enum Event<T> {
    Domain(Envelope<T>),
    Snapshot(Envelope<T>),
    Integration(Envelope<T>),
}

impl<T> Event<T> {
    pub fn envelope(&self) -> &Envelope<T> {
        match self {
            Event::Domain(e) | Event::Snapshot(e) | Event::Integration(e) => e,
        }
    }

    pub fn into_domain(self) -> Option<Envelope<T>> {
        match self {
            Event::Domain(e) => Some(e),
            _ => None,
        }
    }
}

/// A persisted [`Envelope`] returned by a read, carrying the metadata the
/// substrate assigned at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEnvelope<T> {
    pub event_id: Uuid,
    pub event_name: String,
    pub stream_id: Uuid,
    pub stream_name: String,
    pub stream_version: i64,
    pub sequence: i64,
    pub occurred_on: DateTime<Utc>,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: T,
}

/// Specifies how much of a stream (or the global log) a read should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSelect {
    All,
    From(i64),
}
