//! Database error types.

use kiln_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Store(e) => e,
            DbError::InvalidRow(message) => StoreError::Corrupt(message),
            other => StoreError::unavailable("postgres", other),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
