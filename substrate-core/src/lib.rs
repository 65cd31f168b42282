//! Core, storage-agnostic abstractions for a durable event-sourcing
//! substrate: an append-only [`store::EventStore`] with an advisory
//! snapshot sidecar, a transactional [`outbox::Outbox`] for at-least-once
//! publishing, an idempotent [`inbox::Inbox`] for exactly-once receipt, and
//! the polling [`subscription`] loops that read the store back.
//!
//! Persistence is abstracted behind the [`repository::Repository`] port;
//! this crate ships [`inmemory`] implementations for tests and prototypes,
//! and `substrate-postgres` ships the durable one.

pub mod backoff;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod inbox;
pub mod inmemory;
pub mod outbox;
pub mod records;
pub mod repository;
pub mod store;
pub mod subscription;

pub use codec::{Codec, JsonCodec, Registry, RegistryCodec};
pub use config::Config;
pub use error::{InboxError, OutboxError, StoreError, SubscriptionError};
pub use event::{Envelope, Event, Message, PersistedEnvelope, VersionSelect};
pub use inbox::{FailedInboxEvent, Inbox, ReceiveResult};
pub use outbox::{ClaimedOutboxEvent, FailedOutboxEvent, Outbox};
pub use repository::{RecordStream, Repository};
pub use store::{AppendResult, EventStore};
pub use subscription::Subscription;
