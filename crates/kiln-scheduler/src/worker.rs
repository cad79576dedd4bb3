//! Worker that processes jobs from the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kiln_config::WorkerSettings;
use kiln_core::{Error, Result};
use kiln_core::handler::{CancelSignal, JobHandler};
use kiln_core::job::Claim;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::lease::LeaseConfig;
use crate::queue::JobQueue;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Polling and heartbeat settings of a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub channels: Vec<String>,
    /// Job types to dequeue; empty means every type with a registered handler.
    pub job_types: Vec<String>,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl WorkerConfig {
    pub fn new(settings: &WorkerSettings, lease: &LeaseConfig) -> Self {
        Self {
            channels: settings.channels.clone(),
            job_types: settings.job_types.clone(),
            poll_interval: settings.poll_interval,
            heartbeat_interval: lease.heartbeat_interval(),
        }
    }
}

/// What one poll of the queue did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Idle,
    Finished,
    /// The job went back to the queue, or the lease was lost.
    HandedBack,
}

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    queue: JobQueue,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Worker {
    pub fn new(id: impl Into<String>, queue: JobQueue, config: WorkerConfig) -> Self {
        Self {
            id: id.into(),
            queue,
            config,
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for its job type, replacing any earlier one.
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers
            .insert(handler.job_type().to_string(), handler);
        self
    }

    fn job_types(&self) -> Vec<String> {
        if !self.config.job_types.is_empty() {
            return self.config.job_types.clone();
        }
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Claim and run at most one job. Returns whether a job was claimed.
    pub async fn run_once(&self) -> Result<bool> {
        Ok(self.poll().await? != Poll::Idle)
    }

    async fn poll(&self) -> Result<Poll> {
        let job_types = self.job_types();
        let Some(claim) = self.queue.dequeue(&self.config.channels, &job_types).await? else {
            return Ok(Poll::Idle);
        };

        info!(worker_id = %self.id, job_id = %claim.id, job_type = %claim.job_type, "Claimed job");
        Ok(self.process(claim).await)
    }

    /// Every configured job type needs a handler.
    fn check_handlers(&self) -> Result<()> {
        let missing: Vec<&str> = self
            .config
            .job_types
            .iter()
            .filter(|t| !self.handlers.contains_key(*t))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no handler registered for job types: {}",
                missing.join(", ")
            )));
        }
        if self.handlers.is_empty() {
            return Err(Error::InvalidInput("worker has no handlers".to_string()));
        }
        Ok(())
    }

    /// Run the worker loop until `shutdown` turns true.
    ///
    /// A job that is already running is finished before the loop exits. After
    /// a job is handed back the worker waits `poll_interval` before claiming
    /// again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.check_handlers()?;
        info!(worker_id = %self.id, channels = ?self.config.channels, "Starting worker");
        let mut backoff = self.config.poll_interval;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let delay = match self.poll().await {
                Ok(Poll::Finished) => {
                    backoff = self.config.poll_interval;
                    continue;
                }
                // Nothing ready, or the head of the queue was handed back
                Ok(Poll::Idle | Poll::HandedBack) => {
                    backoff = self.config.poll_interval;
                    self.config.poll_interval
                }
                Err(e) if e.is_retryable() => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    let delay = backoff;
                    backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                    delay
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Worker cannot dequeue");
                    return Err(e);
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn process(&self, claim: Claim) -> Poll {
        let Some(handler) = self.handlers.get(&claim.job_type).cloned() else {
            warn!(
                job_id = %claim.id,
                job_type = %claim.job_type,
                "No handler registered, handing job back"
            );
            if let Err(e) = self.queue.requeue(claim.id, claim.token).await {
                warn!(job_id = %claim.id, error = %e, "Failed to requeue job");
            }
            return Poll::HandedBack;
        };

        let cancel = CancelSignal::new();
        let lost = CancelSignal::new();
        let heartbeats = self.spawn_heartbeat(&claim, cancel.clone(), lost.clone());

        let outcome = handler.run(&claim, cancel).await;
        heartbeats.abort();

        if lost.is_cancelled() {
            debug!(job_id = %claim.id, "Lease lost while running, dropping result");
            return Poll::HandedBack;
        }

        let (result, poll) = match outcome.into_result() {
            Some(result) => (
                self.queue.finish(claim.id, claim.token, result).await,
                Poll::Finished,
            ),
            None => (
                self.queue.requeue(claim.id, claim.token).await,
                Poll::HandedBack,
            ),
        };
        match result {
            Ok(()) => {
                debug!(job_id = %claim.id, "Job done");
                poll
            }
            Err(e) if e.is_benign() => {
                debug!(job_id = %claim.id, "Lease lost before the job was reported");
                Poll::HandedBack
            }
            Err(e) => {
                warn!(job_id = %claim.id, error = %e, "Failed to report job");
                Poll::HandedBack
            }
        }
    }

    /// Heartbeat the claim until aborted.
    ///
    /// A cancel request sets `cancel`; a lost lease sets both `lost` and
    /// `cancel` so the handler stops early.
    fn spawn_heartbeat(
        &self,
        claim: &Claim,
        cancel: CancelSignal,
        lost: CancelSignal,
    ) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.config.heartbeat_interval;
        let (id, token) = (claim.id, claim.token);

        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                match queue.heartbeat(id, token).await {
                    Ok(ack) => {
                        if ack.cancel_requested && !cancel.is_cancelled() {
                            info!(job_id = %id, "Cancellation requested");
                            cancel.cancel();
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(job_id = %id, error = %e, "Heartbeat failed, retrying");
                    }
                    Err(e) => {
                        debug!(job_id = %id, error = %e, "Heartbeat rejected, lease lost");
                        lost.cancel();
                        cancel.cancel();
                        break;
                    }
                }
            }
        })
    }
}
