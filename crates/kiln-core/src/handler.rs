//! Handler trait for the jobs a worker executes.
//!
//! The queue never looks inside job payloads. Workers register one handler per
//! job type and hand it each claim of that type.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::job::Claim;

/// Outcome of running a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Finish the job with this result.
    Succeeded(serde_json::Value),
    /// Finish the job with a failure result.
    Failed { message: String },
    /// Hand the job back to the queue without finishing it.
    Requeue,
}

impl JobOutcome {
    /// The result payload to finish the job with, if any.
    ///
    /// Failures are finished jobs too; the payload records the failure.
    pub fn into_result(self) -> Option<serde_json::Value> {
        match self {
            JobOutcome::Succeeded(value) => Some(value),
            JobOutcome::Failed { message } => Some(json!({
                "success": false,
                "error": message,
            })),
            JobOutcome::Requeue => None,
        }
    }
}

/// Cooperative cancellation flag shared between a worker and a running handler.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Executes claims of a single job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler runs.
    fn job_type(&self) -> &str;

    /// Run one claim.
    ///
    /// Long-running handlers should poll `cancel` and return early once it is
    /// set.
    async fn run(&self, claim: &Claim, cancel: CancelSignal) -> JobOutcome;
}
