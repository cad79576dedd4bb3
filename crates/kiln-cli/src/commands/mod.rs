//! CLI command implementations.

pub mod jobs;
pub mod lease;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_config::{LogFormat, LogSettings, StoreConfig};
use kiln_core::JobStore;
use kiln_db::PgJobStore;
use kiln_fs::FsJobStore;
use kiln_scheduler::JobQueue;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Logs go to stderr so stdout stays parseable.
pub fn init_tracing(settings: &LogSettings) {
    let default = settings.filter.as_deref().unwrap_or("info");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr);

    match settings.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Open the configured store and wrap it in a queue.
pub async fn open_queue(store: &StoreConfig, database_url: Option<String>) -> Result<JobQueue> {
    let store: Arc<dyn JobStore> = match store {
        StoreConfig::Fs { path } => {
            let store = FsJobStore::open(path)
                .await
                .with_context(|| format!("opening job directory {}", path.display()))?;
            Arc::new(store)
        }
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            let url = url
                .clone()
                .or(database_url)
                .context("postgres store needs a url or DATABASE_URL")?;

            info!("Connecting to database...");
            let pool = kiln_db::create_pool(&url, *max_connections).await?;
            kiln_db::run_migrations(&pool).await?;
            info!("Database connected");
            Arc::new(PgJobStore::new(pool))
        }
    };
    Ok(JobQueue::new(store))
}

pub fn validate(path: &Path) -> Result<()> {
    match kiln_config::load_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Err(e) => anyhow::bail!("configuration error in {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_fs_queue() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreConfig::Fs {
            path: dir.path().to_path_buf(),
        };

        let queue = open_queue(&store, None).await.unwrap();
        assert!(queue.all_root_job_ids().await.unwrap().is_empty());
        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_postgres_needs_a_url() {
        let store = StoreConfig::Postgres {
            url: None,
            max_connections: 1,
        };
        assert!(open_queue(&store, None).await.is_err());
    }

    #[test]
    fn test_validate_reports_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.kdl");

        std::fs::write(&path, r#"store "fs" path="/srv/jobs""#).unwrap();
        assert!(validate(&path).is_ok());

        std::fs::write(&path, r#"store "fs""#).unwrap();
        assert!(validate(&path).is_err());
    }
}
