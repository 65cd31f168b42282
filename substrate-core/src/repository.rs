//! The repository port: typed data access over a persisted entity set.
//!
//! The Event Store, Outbox and Inbox depend on nothing else for persistence.
//! Each entity ([`crate::records::DomainEventRecord`], [`crate::records::SnapshotRecord`],
//! [`crate::records::OutboxRecord`], [`crate::records::InboxRecord`]) implements
//! [`Record`] to declare its own `Spec` (a WHERE predicate) and `Update` (a SET
//! clause) types, so callers describe intent instead of hand-writing queries
//! outside of a concrete [`Repository`] implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Declares the query and mutation vocabulary for one entity set.
///
/// Kept deliberately narrow: `Spec`/`Update` only need to express the
/// predicates this crate's Event Store/Outbox/Inbox actually issue, not an
/// arbitrary query language.
pub trait Record: Send + Sync + Clone + std::fmt::Debug + 'static {
    type Spec: Send + Sync + std::fmt::Debug + Clone;
    type Update: Send + Sync + std::fmt::Debug + Clone;
}

/// A stream of records returned by [`Repository::query`]. Lazy, finite and
/// non-restartable, matching the Event Store's read semantics.
pub type RecordStream<'a, T, E> = BoxStream<'a, Result<T, E>>;

/// Typed data access over one entity set `T`.
///
/// Mutating calls (`insert`, `bulk_update`, `delete`) participate in whatever
/// ambient unit of work the concrete implementation maintains (a single
/// `sqlx::Transaction` per call, for the Postgres implementation); callers
/// never see the transaction type directly.
#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Appends a batch of new records in one call.
    async fn insert(&self, batch: Vec<T>, cancel: &CancellationToken) -> Result<(), Self::Error>;

    /// Streams every record matching `spec`, in the order the spec implies.
    fn query(&self, spec: T::Spec, cancel: &CancellationToken) -> RecordStream<'static, T, Self::Error>;

    /// Returns the first record matching `spec`, or `None`.
    async fn query_first(
        &self,
        spec: T::Spec,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, Self::Error>;

    /// Returns whether any record matches `spec`.
    async fn exists(&self, spec: T::Spec, cancel: &CancellationToken) -> Result<bool, Self::Error>;

    /// Applies `update` to every record matching `spec`, returning the number
    /// of rows affected. Implementations MUST apply `spec` and `update`
    /// atomically (a single `UPDATE ... WHERE ...` statement), since this is
    /// the race fence claim leasing depends on.
    async fn bulk_update(
        &self,
        spec: T::Spec,
        update: T::Update,
        cancel: &CancellationToken,
    ) -> Result<u64, Self::Error>;

    /// Removes every record matching `spec`, returning the number of rows removed.
    async fn delete(&self, spec: T::Spec, cancel: &CancellationToken) -> Result<u64, Self::Error>;
}
