//! `JobStore` implementation over a directory of JSON records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::fs::File;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_core::graph::DependencyIndex;
use kiln_core::job::{ordered_set, resolve_graph};
use kiln_core::{
    Claim, GraphNode, HeartbeatAck, Job, JobId, JobStatus, JobStore, LeaseToken, NewJob,
    StoreError, StoreResult,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::record::{self, Record};
use crate::{FsError, FsResult};

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    token: LeaseToken,
    last_seen: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    records: HashMap<JobId, Record>,
    index: DependencyIndex,
    /// Liveness of running jobs, mirrored from the records.
    heartbeats: HashMap<JobId, Heartbeat>,
    next_seq: u64,
    /// Held for as long as the store is open.
    lock_file: Option<File>,
    closed: bool,
}

impl State {
    fn get(&self, id: &JobId) -> StoreResult<&Record> {
        self.records.get(id).ok_or(StoreError::NotFound(*id))
    }

    /// Snapshot with reverse edges taken from the index.
    fn snapshot(&self, record: &Record) -> Job {
        let mut job = record.job.clone();
        job.dependants = self.index.dependants(&job.id);
        job
    }

    fn ensure_open(&self) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        Ok(())
    }

    fn running_with(&self, id: &JobId, token: LeaseToken) -> StoreResult<&Record> {
        let record = self.get(id)?;
        if record.job.status != JobStatus::Running || record.job.token != Some(token) {
            return Err(StoreError::TokenMismatch(*id));
        }
        Ok(record)
    }
}

/// Job store keeping one JSON file per job in a directory.
///
/// The directory is owned by a single process for as long as the store is open
/// (enforced with an advisory file lock). Within that process every operation
/// runs under one mutex, which makes claims linearizable.
pub struct FsJobStore {
    dir: PathBuf,
    state: Mutex<State>,
}

impl FsJobStore {
    /// Open the store in an existing directory.
    pub async fn open(dir: impl AsRef<Path>) -> FsResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|e| FsError::io(&dir, e))?;
        if !meta.is_dir() {
            return Err(FsError::io(
                &dir,
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }

        // Dropping the file on a failed load releases the lock.
        let lock = record::acquire_lock(&dir).await?;
        let mut state = Self::load(&dir).await?;
        state.lock_file = Some(lock);

        info!(
            dir = %dir.display(),
            jobs = state.records.len(),
            running = state.heartbeats.len(),
            "Opened filesystem job store"
        );

        Ok(Self {
            dir,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load(dir: &Path) -> FsResult<State> {
        let mut state = State::default();
        let now = Utc::now();

        for mut record in record::load_dir(dir).await? {
            let id = record.job.id;

            if record.job.status == JobStatus::Running {
                match record.job.token {
                    Some(token) => {
                        let last_seen = record
                            .last_heartbeat
                            .or(record.job.started_at)
                            .unwrap_or(now);
                        state.heartbeats.insert(id, Heartbeat { token, last_seen });
                    }
                    None => {
                        warn!(job_id = %id, "Running job without a lease token, requeueing");
                        record.job.status = JobStatus::Pending;
                        record.last_heartbeat = None;
                    }
                }
            }

            state
                .index
                .restore(id, record.job.status, &record.job.dependencies);
            state.next_seq = state.next_seq.max(record.seq + 1);
            state.records.insert(id, record);
        }

        Ok(state)
    }

    /// Persist a changed record, then swap it into memory.
    async fn commit(&self, state: &mut State, record: Record) -> FsResult<()> {
        record::write(&self.dir, &record).await?;
        state.index.set_status(&record.job.id, record.job.status);
        state.records.insert(record.job.id, record);
        Ok(())
    }

    /// Rewrite the redundant reverse edges of `ids`.
    ///
    /// Reverse edges are rebuilt from forward edges on open, so a failure here
    /// only leaves stale data on disk.
    async fn sync_dependants(&self, state: &mut State, ids: &[JobId]) {
        for id in ids {
            let dependants = state.index.dependants(id);
            let Some(record) = state.records.get_mut(id) else {
                continue;
            };
            record.job.dependants = dependants;
            if let Err(e) = record::write(&self.dir, record).await {
                warn!(job_id = %id, error = %e, "Failed to update dependants of job record");
            }
        }
    }

    fn new_record(state: &mut State, job: NewJob, id: JobId, dependencies: Vec<JobId>) -> Record {
        let seq = state.next_seq;
        state.next_seq += 1;
        Record {
            job: Job {
                id,
                job_type: job.job_type,
                channel: job.channel,
                args: job.args,
                dependencies,
                dependants: Vec::new(),
                status: JobStatus::Pending,
                result: None,
                queued_at: Utc::now(),
                started_at: None,
                finished_at: None,
                retries: 0,
                token: None,
                cancel_requested: false,
            },
            seq,
            last_heartbeat: None,
        }
    }

    async fn insert(&self, state: &mut State, record: Record) -> StoreResult<()> {
        let id = record.job.id;
        let dependencies = record.job.dependencies.clone();

        // The new record is the commit point; reverse edges follow.
        record::write(&self.dir, &record).await?;
        state
            .index
            .insert(id, JobStatus::Pending, &dependencies)
            .map_err(StoreError::InvalidDependency)?;
        state.records.insert(id, record);
        self.sync_dependants(state, &dependencies).await;
        Ok(())
    }

    /// Undo a partially written graph, newest job first.
    async fn roll_back(&self, state: &mut State, ids: &[JobId]) {
        let mut touched = Vec::new();
        for id in ids.iter().rev() {
            if let Err(e) = record::remove(&self.dir, id).await {
                warn!(job_id = %id, error = %e, "Failed to roll back job record");
            }
            touched.extend_from_slice(state.index.dependencies(id));
            state.index.remove(id);
            state.records.remove(id);
        }
        touched.retain(|id| !ids.contains(id));
        let touched = ordered_set(&touched);
        self.sync_dependants(state, &touched).await;
    }

    async fn claim(&self, state: &mut State, id: JobId) -> StoreResult<Claim> {
        let mut record = state.get(&id)?.clone();
        let token = LeaseToken::generate();
        let now = Utc::now();
        record.job.status = JobStatus::Running;
        record.job.token = Some(token);
        record.job.started_at = Some(now);
        record.last_heartbeat = Some(now);

        self.commit(state, record).await?;
        state.heartbeats.insert(
            id,
            Heartbeat {
                token,
                last_seen: now,
            },
        );

        let record = state.get(&id)?;
        debug!(job_id = %id, job_type = %record.job.job_type, "Claimed job");
        Ok(Claim::from_job(&state.snapshot(record), token))
    }

    async fn release(&self, state: &mut State, id: JobId) -> StoreResult<()> {
        let mut record = state.get(&id)?.clone();
        record.job.status = JobStatus::Pending;
        record.job.token = None;
        record.job.retries += 1;
        record.last_heartbeat = None;

        self.commit(state, record).await?;
        state.heartbeats.remove(&id);
        Ok(())
    }
}

fn matches_filter(job: &Job, channels: &[String], job_types: &[String]) -> bool {
    channels.iter().any(|c| *c == job.channel)
        && (job_types.is_empty() || job_types.iter().any(|t| *t == job.job_type))
}

#[async_trait]
impl JobStore for FsJobStore {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn enqueue(&self, job: NewJob) -> StoreResult<JobId> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let dependencies = ordered_set(&job.dependencies);
        if let Some(missing) = dependencies.iter().find(|d| !state.index.contains(d)) {
            return Err(StoreError::InvalidDependency(*missing));
        }

        let id = JobId::new();
        let record = Self::new_record(&mut state, job, id, dependencies);
        self.insert(&mut state, record).await?;
        Ok(id)
    }

    async fn enqueue_graph(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<JobId>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let ids: Vec<JobId> = nodes.iter().map(|_| JobId::new()).collect();
        let resolved = resolve_graph(&nodes, &ids).map_err(StoreError::InvalidGraph)?;

        // Validate everything before the first write.
        for deps in &resolved {
            for dep in deps {
                if !state.index.contains(dep) && !ids.contains(dep) {
                    return Err(StoreError::InvalidDependency(*dep));
                }
            }
        }

        let mut written = Vec::with_capacity(ids.len());
        for ((node, id), dependencies) in nodes.into_iter().zip(&ids).zip(resolved) {
            let job = NewJob {
                job_type: node.job_type,
                channel: node.channel,
                args: node.args,
                dependencies: Vec::new(),
            };
            let record = Self::new_record(&mut state, job, *id, dependencies);
            if let Err(e) = self.insert(&mut state, record).await {
                self.roll_back(&mut state, &written).await;
                return Err(e);
            }
            written.push(*id);
        }

        Ok(ids)
    }

    async fn dequeue(
        &self,
        channels: &[String],
        job_types: &[String],
    ) -> StoreResult<Option<Claim>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let candidate = state
            .records
            .values()
            .filter(|r| r.job.status == JobStatus::Pending && !r.job.cancel_requested)
            .filter(|r| matches_filter(&r.job, channels, job_types))
            .filter(|r| state.index.dependencies_finished(&r.job.id))
            .min_by_key(|r| (r.job.queued_at, r.seq))
            .map(|r| r.job.id);

        match candidate {
            Some(id) => self.claim(&mut state, id).await.map(Some),
            None => Ok(None),
        }
    }

    async fn dequeue_by_id(&self, id: JobId) -> StoreResult<Claim> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let record = state.get(&id)?;
        if record.job.status != JobStatus::Pending || record.job.cancel_requested {
            return Err(StoreError::NotPending(id));
        }
        if !state.index.dependencies_finished(&id) {
            return Err(StoreError::NotReady(id));
        }
        self.claim(&mut state, id).await
    }

    async fn heartbeat(&self, id: JobId, token: LeaseToken) -> StoreResult<HeartbeatAck> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let mut record = state.running_with(&id, token)?.clone();
        let now = Utc::now();
        let cancel_requested = record.job.cancel_requested;
        record.last_heartbeat = Some(now);

        self.commit(&mut state, record).await?;
        state.heartbeats.insert(
            id,
            Heartbeat {
                token,
                last_seen: now,
            },
        );
        Ok(HeartbeatAck { cancel_requested })
    }

    async fn requeue(&self, id: JobId, token: LeaseToken) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        state.running_with(&id, token)?;
        self.release(&mut state, id).await?;
        info!(job_id = %id, "Job handed back to the queue");
        Ok(())
    }

    async fn requeue_stale(&self, older_than: Duration) -> StoreResult<Vec<JobId>> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let now = Utc::now();
        let mut stale: Vec<(JobId, LeaseToken)> = state
            .heartbeats
            .iter()
            .filter(|(_, hb)| {
                (now - hb.last_seen)
                    .to_std()
                    .is_ok_and(|age| age > older_than)
            })
            .map(|(id, hb)| (*id, hb.token))
            .collect();
        stale.sort_by_key(|(id, _)| *id);

        let mut requeued = Vec::with_capacity(stale.len());
        for (id, token) in stale {
            // Only requeue the lease whose heartbeat expired.
            if state.running_with(&id, token).is_err() {
                state.heartbeats.remove(&id);
                continue;
            }
            self.release(&mut state, id).await?;
            requeued.push(id);
        }
        Ok(requeued)
    }

    async fn finish(
        &self,
        id: JobId,
        token: LeaseToken,
        result: serde_json::Value,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        if state.get(&id)?.job.status == JobStatus::Finished {
            return Err(StoreError::AlreadyFinished(id));
        }
        let mut record = state.running_with(&id, token)?.clone();
        record.job.status = JobStatus::Finished;
        record.job.result = Some(result);
        record.job.finished_at = Some(Utc::now());
        record.job.token = None;
        record.last_heartbeat = None;

        self.commit(&mut state, record).await?;
        state.heartbeats.remove(&id);
        Ok(())
    }

    async fn cancel(&self, id: JobId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        let record = state.get(&id)?;
        if record.job.status == JobStatus::Finished {
            return Err(StoreError::AlreadyFinished(id));
        }
        if record.job.cancel_requested {
            return Ok(());
        }

        let mut record = record.clone();
        record.job.cancel_requested = true;
        self.commit(&mut state, record).await?;
        Ok(())
    }

    async fn job(&self, id: JobId) -> StoreResult<Job> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        let record = state.get(&id)?;
        Ok(state.snapshot(record))
    }

    async fn id_from_token(&self, token: LeaseToken) -> StoreResult<JobId> {
        let state = self.state.lock().await;
        state.ensure_open()?;

        state
            .heartbeats
            .iter()
            .find(|(_, hb)| hb.token == token)
            .map(|(id, _)| *id)
            .ok_or(StoreError::UnknownToken(token))
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.ensure_open()?;

        if !state.index.contains(&id) {
            return Ok(());
        }
        if !state.index.dependants(&id).is_empty() {
            return Err(StoreError::HasDependants(id));
        }

        let doomed = state.index.deletion_set(&id);
        let mut survivors = Vec::new();
        for job_id in &doomed {
            for dep in state.index.dependencies(job_id) {
                if !doomed.contains(dep) && !survivors.contains(dep) {
                    survivors.push(*dep);
                }
            }
        }

        // Dependencies go first so an interrupted delete leaves the root in
        // place and can simply be retried.
        for job_id in doomed.iter().rev() {
            record::remove(&self.dir, job_id).await?;
            state.index.remove(job_id);
            state.records.remove(job_id);
            state.heartbeats.remove(job_id);
        }
        self.sync_dependants(&mut state, &survivors).await;

        debug!(job_id = %id, removed = doomed.len(), "Deleted job graph");
        Ok(())
    }

    async fn all_root_job_ids(&self) -> StoreResult<Vec<JobId>> {
        let state = self.state.lock().await;
        state.ensure_open()?;
        Ok(state.index.roots())
    }

    async fn close(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.lock_file = None;
        info!(dir = %self.dir.display(), "Closed filesystem job store");
        Ok(())
    }
}
