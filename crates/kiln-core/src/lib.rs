//! Core types and traits for the Kiln job queue.
//!
//! This crate contains:
//! - Job and lease identifiers
//! - The job record and operation inputs/outputs
//! - The `JobStore` contract every backend implements
//! - The in-memory dependency graph index
//! - The handler trait workers run jobs with
//! - The shared backend test suite (feature `contract`)

#[cfg(feature = "contract")]
pub mod contract;
pub mod error;
pub mod graph;
pub mod handler;
pub mod id;
pub mod job;
pub mod store;

pub use error::{Error, Result, StoreError, StoreResult};
pub use id::{JobId, LeaseToken};
pub use job::{Claim, GraphDependency, GraphNode, HeartbeatAck, Job, JobStatus, NewJob};
pub use store::JobStore;
