//! Lease expiry and the stale-job sweeper.

use std::time::Duration;

use kiln_config::LeaseSettings;
use kiln_config::config::MIN_EXPIRY_HEARTBEATS;
use kiln_core::{Error, JobId, Result};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::queue::JobQueue;

/// Heartbeat timing shared by workers and the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseConfig {
    heartbeat_interval: Duration,
    expiry: Duration,
}

impl LeaseConfig {
    pub fn new(heartbeat_interval: Duration, expiry: Duration) -> Result<Self> {
        if heartbeat_interval.is_zero() {
            return Err(Error::InvalidInput(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        let Some(min_expiry) = heartbeat_interval.checked_mul(MIN_EXPIRY_HEARTBEATS) else {
            return Err(Error::InvalidInput(format!(
                "heartbeat interval {:?} is too large",
                heartbeat_interval
            )));
        };
        if expiry < min_expiry {
            return Err(Error::InvalidInput(format!(
                "lease expiry {:?} is shorter than {} heartbeat intervals of {:?}",
                expiry, MIN_EXPIRY_HEARTBEATS, heartbeat_interval
            )));
        }
        Ok(Self {
            heartbeat_interval,
            expiry,
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }
}

impl TryFrom<&LeaseSettings> for LeaseConfig {
    type Error = Error;

    fn try_from(settings: &LeaseSettings) -> Result<Self> {
        Self::new(settings.heartbeat_interval, settings.expiry)
    }
}

/// Returns leases whose holders stopped heartbeating to the queue.
///
/// This is the only way a running job goes back to pending without the
/// worker's help. A job that keeps heartbeating is never requeued, however
/// long it runs.
pub struct LeaseManager {
    queue: JobQueue,
    config: LeaseConfig,
    sweep_interval: Duration,
}

impl LeaseManager {
    pub fn new(queue: JobQueue, config: LeaseConfig, sweep_interval: Duration) -> Self {
        Self {
            queue,
            config,
            sweep_interval,
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Requeue every job whose lease expired.
    pub async fn sweep_once(&self) -> Result<Vec<JobId>> {
        let requeued = self.queue.requeue_stale(self.config.expiry).await?;
        for id in &requeued {
            info!(job_id = %id, expiry = ?self.config.expiry, "Requeued job with expired lease");
        }
        Ok(requeued)
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true or its sender
    /// goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.sweep_interval,
            expiry = ?self.config.expiry,
            "Starting lease sweeper"
        );

        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(requeued) if requeued.is_empty() => debug!("No expired leases"),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Lease sweep failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Lease sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_must_cover_three_heartbeats() {
        let hb = Duration::from_secs(30);

        assert!(LeaseConfig::new(hb, Duration::from_secs(89)).is_err());
        let config = LeaseConfig::new(hb, Duration::from_secs(90)).unwrap();
        assert_eq!(config.heartbeat_interval(), hb);
        assert_eq!(config.expiry(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_heartbeat_is_rejected() {
        assert!(matches!(
            LeaseConfig::new(Duration::ZERO, Duration::from_secs(1)),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_huge_heartbeat_is_rejected() {
        assert!(matches!(
            LeaseConfig::new(Duration::MAX, Duration::MAX),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let config = LeaseConfig::try_from(&LeaseSettings::default()).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.expiry(), Duration::from_secs(120));
    }
}
