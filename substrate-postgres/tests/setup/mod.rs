use std::sync::Once;

use envconfig::Envconfig;
use sqlx::PgPool;
use substrate_core::config::Config;

static INIT_LOGGING: Once = Once::new();

/// Connects to the Postgres instance described by `DB_HOST`/`DB_PORT`/etc.
/// (see [`substrate_core::config::Config`]), running migrations before
/// handing back the pool. Returns `None` if `SUBSTRATE_POSTGRES_TESTS` is
/// unset, the gate every test in this directory checks before running
/// against a real database.
pub async fn connect_to_database() -> Option<PgPool> {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });

    if std::env::var("SUBSTRATE_POSTGRES_TESTS").is_err() {
        return None;
    }

    let config = Config::init_from_env().expect("failed to load test database configuration");

    let pool = PgPool::connect(&config.postgres_dsn())
        .await
        .expect("failed to connect to the test database");

    substrate_postgres::MIGRATIONS
        .run(&pool)
        .await
        .expect("failed to run migrations against the test database");

    Some(pool)
}
