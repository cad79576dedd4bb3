//! Caller-facing job queue.

use std::sync::Arc;
use std::time::Duration;

use kiln_core::job::{Claim, GraphNode, HeartbeatAck, Job, NewJob};
use kiln_core::{Error, JobId, JobStore, LeaseToken, Result, StoreError, StoreResult};
use tracing::{debug, error, warn};

/// Job queue backed by any [`JobStore`].
///
/// Cloning is cheap; every clone talks to the same store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job whose dependencies are already queued.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        check_name("job type", &job.job_type)?;
        check_name("channel", &job.channel)?;

        let id = self.report("enqueue", self.store.enqueue(job).await)?;
        debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Enqueue a whole graph atomically. Ids come back in node order.
    pub async fn enqueue_graph(&self, nodes: Vec<GraphNode>) -> Result<Vec<JobId>> {
        for node in &nodes {
            check_name("job type", &node.job_type)?;
            check_name("channel", &node.channel)?;
        }
        self.report("enqueue_graph", self.store.enqueue_graph(nodes).await)
    }

    /// Claim the oldest ready job on one of `channels`.
    ///
    /// An empty `job_types` accepts every type. `Ok(None)` means nothing is
    /// ready; polling is up to the caller.
    pub async fn dequeue(&self, channels: &[String], job_types: &[String]) -> Result<Option<Claim>> {
        check_filters(channels, job_types)?;
        self.report("dequeue", self.store.dequeue(channels, job_types).await)
    }

    pub async fn dequeue_by_id(&self, id: JobId) -> Result<Claim> {
        self.report("dequeue_by_id", self.store.dequeue_by_id(id).await)
    }

    pub async fn heartbeat(&self, id: JobId, token: LeaseToken) -> Result<HeartbeatAck> {
        self.report("heartbeat", self.store.heartbeat(id, token).await)
    }

    pub async fn requeue(&self, id: JobId, token: LeaseToken) -> Result<()> {
        self.report("requeue", self.store.requeue(id, token).await)
    }

    pub async fn requeue_stale(&self, older_than: Duration) -> Result<Vec<JobId>> {
        self.report("requeue_stale", self.store.requeue_stale(older_than).await)
    }

    pub async fn finish(&self, id: JobId, token: LeaseToken, result: serde_json::Value) -> Result<()> {
        self.report("finish", self.store.finish(id, token, result).await)?;
        debug!(job_id = %id, "Job finished");
        Ok(())
    }

    /// Ask a pending or running job to stop.
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.report("cancel", self.store.cancel(id).await)
    }

    pub async fn job(&self, id: JobId) -> Result<Job> {
        self.report("job", self.store.job(id).await)
    }

    pub async fn id_from_token(&self, token: LeaseToken) -> Result<JobId> {
        self.report("id_from_token", self.store.id_from_token(token).await)
    }

    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        self.report("delete_job", self.store.delete_job(id).await)
    }

    pub async fn all_root_job_ids(&self) -> Result<Vec<JobId>> {
        self.report("all_root_job_ids", self.store.all_root_job_ids().await)
    }

    pub async fn close(&self) -> Result<()> {
        self.report("close", self.store.close().await)
    }

    /// Log a failed store call at a level matching its severity and convert
    /// it for the caller.
    fn report<T>(&self, op: &'static str, result: StoreResult<T>) -> Result<T> {
        result.map_err(|err| {
            let backend = self.store.name();
            match &err {
                StoreError::TokenMismatch(id) => {
                    debug!(op, backend, job_id = %id, "Lease no longer held");
                }
                StoreError::AlreadyFinished(id) => {
                    error!(op, backend, job_id = %id, "Job was already finished");
                }
                StoreError::Corrupt(message) => {
                    warn!(op, backend, message = %message, "Corrupt job record");
                }
                StoreError::Unavailable { .. } => {
                    warn!(op, backend, error = %err, "Job store unavailable");
                }
                _ => debug!(op, backend, error = %err, "Job store rejected request"),
            }
            Error::from(err)
        })
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn check_filters(channels: &[String], job_types: &[String]) -> Result<()> {
    if channels.is_empty() {
        return Err(Error::InvalidInput(
            "at least one channel is required".to_string(),
        ));
    }
    for channel in channels {
        check_name("channel", channel)?;
    }
    for job_type in job_types {
        check_name("job type", job_type)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_filters_need_a_channel() {
        assert!(matches!(
            check_filters(&[], &[]),
            Err(Error::InvalidInput(_))
        ));
        assert!(check_filters(&names(&["x86_64"]), &[]).is_ok());
    }

    #[test]
    fn test_filters_reject_empty_names() {
        assert!(check_filters(&names(&["x86_64", ""]), &[]).is_err());
        assert!(check_filters(&names(&["x86_64"]), &names(&[""])).is_err());
        assert!(check_filters(&names(&["x86_64"]), &names(&["depsolve"])).is_ok());
    }

    #[tokio::test]
    async fn test_queue_validates_before_touching_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = kiln_fs::FsJobStore::open(dir.path()).await.unwrap();
        let queue = JobQueue::new(Arc::new(store));

        let err = queue.enqueue(NewJob::new("", "x86_64")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(queue.all_root_job_ids().await.unwrap().is_empty());

        let err = queue.dequeue(&[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        queue.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_errors_reach_the_caller_translated() {
        let dir = tempfile::tempdir().unwrap();
        let store = kiln_fs::FsJobStore::open(dir.path()).await.unwrap();
        let queue = JobQueue::new(Arc::new(store));

        let ghost = JobId::new();
        let err = queue
            .enqueue(NewJob::new("manifest", "x86_64").with_dependencies([ghost]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDependency(_)));

        let err = queue.job(ghost).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let err = queue.id_from_token(LeaseToken::generate()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let id = queue.enqueue(NewJob::new("depsolve", "x86_64")).await.unwrap();
        let claim = queue
            .dequeue(&["x86_64".to_string()], &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.id, id);

        let err = queue
            .finish(id, LeaseToken::generate(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_benign());

        queue
            .finish(id, claim.token, serde_json::json!({"ok": true}))
            .await
            .unwrap();
        let err = queue
            .finish(id, claim.token, serde_json::json!({"ok": true}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyFinished(_)));

        queue.close().await.unwrap();
    }
}
