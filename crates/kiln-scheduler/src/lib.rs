//! Job scheduling for the Kiln job queue.
//!
//! [`JobQueue`] is the caller-facing façade over a [`kiln_core::JobStore`].
//! [`LeaseManager`] requeues jobs whose workers stopped heartbeating, and
//! [`Worker`] is the poll loop that runs claimed jobs.

pub mod lease;
pub mod queue;
pub mod worker;

pub use lease::{LeaseConfig, LeaseManager};
pub use queue::JobQueue;
pub use worker::{Worker, WorkerConfig};
