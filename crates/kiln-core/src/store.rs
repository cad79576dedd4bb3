//! The job store contract.
//!
//! Every storage backend implements [`JobStore`] with identical observable
//! behaviour; the `contract` feature ships the shared test suite that checks it.

use std::time::Duration;

use async_trait::async_trait;

use crate::job::{Claim, GraphNode, HeartbeatAck, Job, NewJob};
use crate::{JobId, LeaseToken, StoreResult};

/// Durable store of jobs, their dependency edges and their leases.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Persist a job whose dependencies are all already stored.
    async fn enqueue(&self, job: NewJob) -> StoreResult<JobId>;

    /// Persist a whole graph or nothing.
    ///
    /// Returned ids are in node order.
    async fn enqueue_graph(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<JobId>>;

    /// Claim the oldest ready job matching the filters.
    ///
    /// An empty `job_types` matches every type. Returns `Ok(None)` when no job
    /// is ready; the store never waits for one.
    async fn dequeue(&self, channels: &[String], job_types: &[String])
    -> StoreResult<Option<Claim>>;

    /// Claim one specific ready job.
    async fn dequeue_by_id(&self, id: JobId) -> StoreResult<Claim>;

    /// Refresh the liveness record of a running job.
    async fn heartbeat(&self, id: JobId, token: LeaseToken) -> StoreResult<HeartbeatAck>;

    /// Give a claim back, making the job pending again.
    async fn requeue(&self, id: JobId, token: LeaseToken) -> StoreResult<()>;

    /// Requeue every running job whose last heartbeat is older than `older_than`.
    async fn requeue_stale(&self, older_than: Duration) -> StoreResult<Vec<JobId>>;

    /// Mark a running job finished with its result.
    async fn finish(
        &self,
        id: JobId,
        token: LeaseToken,
        result: serde_json::Value,
    ) -> StoreResult<()>;

    /// Ask a job to stop. Observed by the worker through heartbeats.
    async fn cancel(&self, id: JobId) -> StoreResult<()>;

    async fn job(&self, id: JobId) -> StoreResult<Job>;

    /// The job currently leased under `token`.
    async fn id_from_token(&self, token: LeaseToken) -> StoreResult<JobId>;

    /// Delete a root job and every dependency nothing else needs.
    ///
    /// Unknown ids are a no-op.
    async fn delete_job(&self, id: JobId) -> StoreResult<()>;

    /// Ids of all jobs nobody depends on, sorted.
    async fn all_root_job_ids(&self) -> StoreResult<Vec<JobId>>;

    /// Release the backend. The store must not be used afterwards.
    async fn close(&self) -> StoreResult<()>;
}
