//! The error type every repository in this crate surfaces as its
//! [`substrate_core::Repository::Error`], mirroring `eventually-postgres::event::StreamError`:
//! a couple of well-known variants for row conversion, plus a catch-all for
//! whatever `sqlx` itself returns.

use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row};

#[derive(Debug, thiserror::Error)]
pub enum PgRepositoryError {
    #[error("failed to read column '{name}' from result row: {error}")]
    ReadColumn {
        name: &'static str,
        #[source]
        error: sqlx::Error,
    },

    #[error("failed to decode value from column '{name}': {cause}")]
    Decode {
        name: &'static str,
        #[source]
        cause: anyhow::Error,
    },

    #[error("db returned an error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn try_get_column<T>(row: &PgRow, name: &'static str) -> Result<T, PgRepositoryError>
where
    for<'a> T: sqlx::Type<Postgres> + sqlx::Decode<'a, Postgres>,
{
    row.try_get(name)
        .map_err(|error| PgRepositoryError::ReadColumn { name, error })
}
