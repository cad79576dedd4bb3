//! Runs the shared store contract against PostgreSQL.
//!
//! Skipped unless `DATABASE_URL` points at a database the tests may create
//! schemas in. Every test gets its own schema.

use std::sync::Arc;

use kiln_core::JobStore;
use kiln_db::{PgJobStore, run_migrations};
use sqlx::postgres::PgPoolOptions;

async fn pg_store() -> Option<(Arc<dyn JobStore>, String)> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping PostgreSQL contract case");
        return None;
    };
    let schema = format!("kiln_test_{}", uuid::Uuid::new_v4().simple());

    let admin = PgPoolOptions::new()
        .max_connections(1)
        .connect(&url)
        .await
        .expect("connect to DATABASE_URL");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin)
        .await
        .expect("create test schema");
    admin.close().await;

    let search_path = format!("SET search_path TO {}", schema);
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                sqlx::query(&search_path).execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .expect("connect test pool");
    run_migrations(&pool).await.expect("run migrations");

    Some((Arc::new(PgJobStore::new(pool)), schema))
}

kiln_core::contract_tests!(pg_store);
