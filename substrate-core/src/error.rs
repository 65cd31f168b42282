//! Error taxonomy shared by the Event Store, Outbox, Inbox and Subscription modules.
//!
//! Every leaf error type here implements [`std::error::Error`] through [`thiserror`],
//! following the same layering as an `AppendError`/`StreamError` pair: a handful of
//! well-known, matchable variants plus a catch-all wrapping the underlying cause.

use uuid::Uuid;

/// Returned when an `append` call's `expected_version` does not match the
/// stream's actual current version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
pub struct ConcurrencyConflict {
    pub stream_id: Uuid,
    pub expected: i64,
    pub actual: i64,
}

/// Returned when a codec fails to convert between an in-memory event and its
/// persisted representation. Stable across every codec implementation.
#[derive(Debug, thiserror::Error)]
#[error("codec failed to process event '{event_name}': {cause}")]
pub struct CodecError {
    pub event_name: String,
    #[source]
    pub cause: anyhow::Error,
}

impl CodecError {
    pub fn new(event_name: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            event_name: event_name.into(),
            cause: cause.into(),
        }
    }
}

/// Error surfaced by the repository port. Implementations wrap their own
/// transport error (e.g. a `sqlx::Error`) as the source.
#[derive(Debug, thiserror::Error)]
#[error("repository operation failed: {0}")]
pub struct RepositoryError(#[source] pub anyhow::Error);

impl RepositoryError {
    pub fn new(cause: impl Into<anyhow::Error>) -> Self {
        Self(cause.into())
    }
}

/// Returned when an operation is cancelled through its [`tokio_util::sync::CancellationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation was cancelled")]
pub struct Cancelled;

/// Returned for programming errors: invalid or missing arguments that should
/// never be retried (e.g. an empty batch passed to `complete`).
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid argument: {0}")]
pub struct InvalidArgument(pub String);

/// Returned by optional reads (snapshot, single-record lookups) that found nothing.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("no matching record was found")]
pub struct NotFound;

/// Returned when appending to a stream that has been soft-deleted and not
/// since undeleted (see `EventStore::undelete_stream`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream {stream_id} has been deleted")]
pub struct StreamDeleted {
    pub stream_id: Uuid,
}

/// Umbrella error type returned by the Event Store's public operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyConflict),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    StreamDeleted(#[from] StreamDeleted),

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Umbrella error type returned by the Outbox's public operations.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Umbrella error type returned by the Inbox's public operations.
#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Error propagated out of a subscription's polling loop. `Cancelled` is
/// swallowed by the loop's own teardown path and never reaches this type;
/// it only appears here if a caller inspects a loop that raced its own shutdown.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("subscription handler failed: {0}")]
    Handler(#[source] anyhow::Error),
}
