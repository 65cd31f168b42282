//! PostgreSQL-backed [`substrate_core::repository::Repository`] implementations:
//! one per entity set, all sharing a single `sqlx::PgPool` and the schema
//! migrations under `migrations/`.

pub mod domain_event_repository;
pub mod error;
pub mod inbox_repository;
pub mod outbox_repository;
pub mod snapshot_repository;

pub use domain_event_repository::PgDomainEventRepository;
pub use error::PgRepositoryError;
pub use inbox_repository::PgInboxRepository;
pub use outbox_repository::PgOutboxRepository;
pub use snapshot_repository::PgSnapshotRepository;

/// Embedded schema migrations, run once at startup via `MIGRATIONS.run(&pool)`,
/// the way `eventually-postgres::event::Store::new` runs its own `MIGRATIONS`
/// before handing out a usable store.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
