//! Lease sweeper commands.

use anyhow::Result;
use kiln_config::LeaseSettings;
use kiln_scheduler::{JobQueue, LeaseConfig, LeaseManager};
use tokio::sync::watch;
use tracing::info;

fn manager(queue: &JobQueue, settings: &LeaseSettings) -> Result<LeaseManager> {
    let config = LeaseConfig::try_from(settings)?;
    Ok(LeaseManager::new(
        queue.clone(),
        config,
        settings.sweep_interval,
    ))
}

pub async fn sweep(queue: &JobQueue, settings: &LeaseSettings) -> Result<()> {
    let requeued = manager(queue, settings)?.sweep_once().await?;
    for id in &requeued {
        println!("{}", id);
    }
    Ok(())
}

pub async fn serve(queue: &JobQueue, settings: &LeaseSettings) -> Result<()> {
    let manager = manager(queue, settings)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = tokio::spawn(async move { manager.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send(true)?;
    sweeper.await?;
    Ok(())
}
