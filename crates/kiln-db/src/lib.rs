//! PostgreSQL job store for the Kiln job queue.
//!
//! Claims run in a single transaction that locks the candidate row with
//! `FOR UPDATE SKIP LOCKED`, so any number of processes can share one database.

pub mod error;
mod row;
pub mod store;

pub use error::{DbError, DbResult};
pub use store::PgJobStore;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
