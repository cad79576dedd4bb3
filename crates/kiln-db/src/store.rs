//! [`JobStore`] backed by PostgreSQL.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::job::{Claim, GraphNode, HeartbeatAck, Job, NewJob, ordered_set, resolve_graph};
use kiln_core::{JobId, JobStatus, JobStore, LeaseToken, StoreError, StoreResult};
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::row::{JOB_COLUMNS, JobRow, LeaseRow, uuids};
use crate::DbResult;

/// Job store sharing one PostgreSQL database between any number of processes.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_job(conn: &mut PgConnection, id: JobId) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let dependencies = Self::dependencies_of(conn, id).await?;
        let dependants: Vec<Uuid> = sqlx::query_scalar(
            "SELECT job_id FROM job_dependencies WHERE dependency_id = $1 ORDER BY job_id",
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;

        Ok(Some(row.into_job(dependencies, dependants)?))
    }

    async fn dependencies_of(conn: &mut PgConnection, id: JobId) -> DbResult<Vec<Uuid>> {
        let deps = sqlx::query_scalar(
            "SELECT dependency_id FROM job_dependencies WHERE job_id = $1 ORDER BY position",
        )
        .bind(id.as_uuid())
        .fetch_all(conn)
        .await?;
        Ok(deps)
    }

    /// Lock the status and lease columns of a job for the rest of the transaction.
    async fn lock_lease(conn: &mut PgConnection, id: JobId) -> DbResult<LeaseRow> {
        let row = sqlx::query_as::<_, LeaseRow>(
            "SELECT status, token, cancel_requested FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await?;
        row.ok_or_else(|| StoreError::NotFound(id).into())
    }

    /// Lock the given dependencies against deletion and report the first missing one.
    async fn check_dependencies(conn: &mut PgConnection, deps: &[JobId]) -> DbResult<()> {
        if deps.is_empty() {
            return Ok(());
        }
        let found: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM jobs WHERE id = ANY($1) FOR SHARE")
            .bind(uuids(deps))
            .fetch_all(conn)
            .await?;
        let found: HashSet<Uuid> = found.into_iter().collect();

        match deps.iter().find(|d| !found.contains(d.as_uuid())) {
            Some(missing) => Err(StoreError::InvalidDependency(*missing).into()),
            None => Ok(()),
        }
    }

    async fn insert_job(
        conn: &mut PgConnection,
        id: JobId,
        job_type: &str,
        channel: &str,
        args: &serde_json::Value,
        dependencies: &[JobId],
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, channel, args, status, queued_at)
            VALUES ($1, $2, $3, $4, 'pending', clock_timestamp())
            "#,
        )
        .bind(id.as_uuid())
        .bind(job_type)
        .bind(channel)
        .bind(args)
        .execute(&mut *conn)
        .await?;

        if !dependencies.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO job_dependencies (job_id, dependency_id, position)
                SELECT $1, dep, pos - 1
                FROM UNNEST($2::uuid[]) WITH ORDINALITY AS t(dep, pos)
                "#,
            )
            .bind(id.as_uuid())
            .bind(uuids(dependencies))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// Move a locked, ready job to running under a fresh lease.
    async fn claim_locked(conn: &mut PgConnection, id: JobId) -> DbResult<Claim> {
        let token = LeaseToken::generate();

        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs SET status = 'running', token = $2, started_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO heartbeats (job_id, token, last_seen)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_id) DO UPDATE SET token = EXCLUDED.token, last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .execute(&mut *conn)
        .await?;

        let dependencies = Self::dependencies_of(conn, id).await?;
        let job = row.into_job(dependencies, Vec::new())?;
        Ok(Claim::from_job(&job, token))
    }

    /// Error for a lease operation whose token did not match.
    async fn lease_miss(&self, id: JobId) -> DbResult<StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(if exists {
            StoreError::TokenMismatch(id)
        } else {
            StoreError::NotFound(id)
        })
    }

    async fn enqueue_inner(&self, job: NewJob) -> DbResult<JobId> {
        let dependencies = ordered_set(&job.dependencies);
        let id = JobId::new();

        let mut tx = self.pool.begin().await?;
        Self::check_dependencies(&mut tx, &dependencies).await?;
        Self::insert_job(
            &mut tx,
            id,
            &job.job_type,
            &job.channel,
            &job.args,
            &dependencies,
        )
        .await?;
        tx.commit().await?;

        debug!(job_id = %id, job_type = %job.job_type, "Enqueued job");
        Ok(id)
    }

    async fn enqueue_graph_inner(&self, nodes: Vec<GraphNode>) -> DbResult<Vec<JobId>> {
        let ids: Vec<JobId> = nodes.iter().map(|_| JobId::new()).collect();
        let resolved = resolve_graph(&nodes, &ids).map_err(StoreError::InvalidGraph)?;

        let existing: Vec<JobId> = ordered_set(
            &resolved
                .iter()
                .flatten()
                .filter(|dep| !ids.contains(dep))
                .copied()
                .collect::<Vec<_>>(),
        );

        let mut tx = self.pool.begin().await?;
        Self::check_dependencies(&mut tx, &existing).await?;
        for ((node, id), dependencies) in nodes.iter().zip(&ids).zip(&resolved) {
            Self::insert_job(
                &mut tx,
                *id,
                &node.job_type,
                &node.channel,
                &node.args,
                dependencies,
            )
            .await?;
        }
        tx.commit().await?;

        debug!(jobs = ids.len(), "Enqueued job graph");
        Ok(ids)
    }

    async fn dequeue_inner(
        &self,
        channels: &[String],
        job_types: &[String],
    ) -> DbResult<Option<Claim>> {
        let mut tx = self.pool.begin().await?;

        // Rows locked by another claimer are skipped rather than waited on.
        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT j.id FROM jobs j
            WHERE j.status = 'pending'
              AND NOT j.cancel_requested
              AND j.channel = ANY($1)
              AND (cardinality($2::text[]) = 0 OR j.job_type = ANY($2))
              AND NOT EXISTS (
                  SELECT 1 FROM job_dependencies d
                  JOIN jobs dep ON dep.id = d.dependency_id
                  WHERE d.job_id = j.id AND dep.status <> 'finished'
              )
            ORDER BY j.queued_at, j.seq
            LIMIT 1
            FOR UPDATE OF j SKIP LOCKED
            "#,
        )
        .bind(channels)
        .bind(job_types)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claim = Self::claim_locked(&mut tx, JobId::from_uuid(id)).await?;
        tx.commit().await?;

        info!(job_id = %claim.id, job_type = %claim.job_type, "Job claimed");
        Ok(Some(claim))
    }

    async fn dequeue_by_id_inner(&self, id: JobId) -> DbResult<Claim> {
        let mut tx = self.pool.begin().await?;

        let lease = Self::lock_lease(&mut tx, id).await?;
        if lease.status()? != JobStatus::Pending || lease.cancel_requested {
            return Err(StoreError::NotPending(id).into());
        }

        let blocked: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM job_dependencies d
                JOIN jobs dep ON dep.id = d.dependency_id
                WHERE d.job_id = $1 AND dep.status <> 'finished'
            )
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if blocked {
            return Err(StoreError::NotReady(id).into());
        }

        let claim = Self::claim_locked(&mut tx, id).await?;
        tx.commit().await?;

        info!(job_id = %id, job_type = %claim.job_type, "Job claimed by id");
        Ok(claim)
    }

    async fn heartbeat_inner(&self, id: JobId, token: LeaseToken) -> DbResult<HeartbeatAck> {
        let cancel_requested: Option<bool> = sqlx::query_scalar(
            r#"
            UPDATE heartbeats h SET last_seen = NOW()
            FROM jobs j
            WHERE h.job_id = $1 AND h.token = $2
              AND j.id = h.job_id AND j.status = 'running' AND j.token = $2
            RETURNING j.cancel_requested
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match cancel_requested {
            Some(cancel_requested) => Ok(HeartbeatAck { cancel_requested }),
            None => Err(self.lease_miss(id).await?.into()),
        }
    }

    async fn requeue_inner(&self, id: JobId, token: LeaseToken) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let requeued: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs SET status = 'pending', token = NULL, retries = retries + 1
            WHERE id = $1 AND status = 'running' AND token = $2
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        if requeued.is_none() {
            drop(tx);
            return Err(self.lease_miss(id).await?.into());
        }

        sqlx::query("DELETE FROM heartbeats WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(job_id = %id, "Job handed back to the queue");
        Ok(())
    }

    async fn requeue_stale_inner(&self, older_than: Duration) -> DbResult<Vec<JobId>> {
        let micros = i64::try_from(older_than.as_micros()).unwrap_or(i64::MAX);

        // A heartbeat refreshed while this runs re-checks `last_seen` under
        // the row lock and keeps its lease.
        let mut ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH stale AS (
                DELETE FROM heartbeats
                WHERE last_seen < NOW() - ($1::bigint * INTERVAL '1 microsecond')
                RETURNING job_id, token
            )
            UPDATE jobs j
            SET status = 'pending', token = NULL, retries = j.retries + 1
            FROM stale s
            WHERE j.id = s.job_id AND j.token = s.token AND j.status = 'running'
            RETURNING j.id
            "#,
        )
        .bind(micros)
        .fetch_all(&self.pool)
        .await?;

        ids.sort();
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }

    async fn finish_inner(
        &self,
        id: JobId,
        token: LeaseToken,
        result: serde_json::Value,
    ) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let lease = Self::lock_lease(&mut tx, id).await?;
        if lease.status()?.is_terminal() {
            return Err(StoreError::AlreadyFinished(id).into());
        }
        if !lease.holds(token)? {
            return Err(StoreError::TokenMismatch(id).into());
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'finished', result = $2, finished_at = NOW(), token = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(&result)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM heartbeats WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_inner(&self, id: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let lease = Self::lock_lease(&mut tx, id).await?;
        if lease.status()?.is_terminal() {
            return Err(StoreError::AlreadyFinished(id).into());
        }
        if lease.cancel_requested {
            return Ok(());
        }

        sqlx::query("UPDATE jobs SET cancel_requested = TRUE WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn job_inner(&self, id: JobId) -> DbResult<Job> {
        let mut conn = self.pool.acquire().await?;
        Self::load_job(&mut conn, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id).into())
    }

    async fn id_from_token_inner(&self, token: LeaseToken) -> DbResult<JobId> {
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT h.job_id FROM heartbeats h
            JOIN jobs j ON j.id = h.job_id
            WHERE h.token = $1 AND j.status = 'running' AND j.token = $1
            "#,
        )
        .bind(token.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        id.map(JobId::from_uuid)
            .ok_or_else(|| StoreError::UnknownToken(token).into())
    }

    async fn delete_job_inner(&self, id: JobId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let found: Option<Uuid> = sqlx::query_scalar("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        if found.is_none() {
            return Ok(());
        }

        let has_dependants: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM job_dependencies WHERE dependency_id = $1)",
        )
        .bind(id.as_uuid())
        .fetch_one(&mut *tx)
        .await?;
        if has_dependants {
            return Err(StoreError::HasDependants(id).into());
        }

        let mut candidates: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE reachable (id) AS (
                SELECT dependency_id FROM job_dependencies WHERE job_id = $1
                UNION
                SELECT d.dependency_id FROM job_dependencies d
                JOIN reachable r ON d.job_id = r.id
            )
            SELECT id FROM reachable
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        let mut removed = 1;

        // Each pass removes the candidates left without dependants; a shared
        // dependency keeps an edge from a survivor and is never removed.
        while !candidates.is_empty() {
            let deleted: Vec<Uuid> = sqlx::query_scalar(
                r#"
                DELETE FROM jobs j
                WHERE j.id = ANY($1)
                  AND NOT EXISTS (SELECT 1 FROM job_dependencies d WHERE d.dependency_id = j.id)
                RETURNING j.id
                "#,
            )
            .bind(&candidates)
            .fetch_all(&mut *tx)
            .await?;

            if deleted.is_empty() {
                break;
            }
            removed += deleted.len();
            candidates.retain(|c| !deleted.contains(c));
        }
        tx.commit().await?;

        debug!(job_id = %id, removed, "Deleted job graph");
        Ok(())
    }

    async fn all_root_job_ids_inner(&self) -> DbResult<Vec<JobId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT j.id FROM jobs j
            WHERE NOT EXISTS (SELECT 1 FROM job_dependencies d WHERE d.dependency_id = j.id)
            ORDER BY j.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(JobId::from_uuid).collect())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn enqueue(&self, job: NewJob) -> StoreResult<JobId> {
        Ok(self.enqueue_inner(job).await?)
    }

    async fn enqueue_graph(&self, nodes: Vec<GraphNode>) -> StoreResult<Vec<JobId>> {
        Ok(self.enqueue_graph_inner(nodes).await?)
    }

    async fn dequeue(
        &self,
        channels: &[String],
        job_types: &[String],
    ) -> StoreResult<Option<Claim>> {
        Ok(self.dequeue_inner(channels, job_types).await?)
    }

    async fn dequeue_by_id(&self, id: JobId) -> StoreResult<Claim> {
        Ok(self.dequeue_by_id_inner(id).await?)
    }

    async fn heartbeat(&self, id: JobId, token: LeaseToken) -> StoreResult<HeartbeatAck> {
        Ok(self.heartbeat_inner(id, token).await?)
    }

    async fn requeue(&self, id: JobId, token: LeaseToken) -> StoreResult<()> {
        Ok(self.requeue_inner(id, token).await?)
    }

    async fn requeue_stale(&self, older_than: Duration) -> StoreResult<Vec<JobId>> {
        Ok(self.requeue_stale_inner(older_than).await?)
    }

    async fn finish(
        &self,
        id: JobId,
        token: LeaseToken,
        result: serde_json::Value,
    ) -> StoreResult<()> {
        Ok(self.finish_inner(id, token, result).await?)
    }

    async fn cancel(&self, id: JobId) -> StoreResult<()> {
        Ok(self.cancel_inner(id).await?)
    }

    async fn job(&self, id: JobId) -> StoreResult<Job> {
        Ok(self.job_inner(id).await?)
    }

    async fn id_from_token(&self, token: LeaseToken) -> StoreResult<JobId> {
        Ok(self.id_from_token_inner(token).await?)
    }

    async fn delete_job(&self, id: JobId) -> StoreResult<()> {
        Ok(self.delete_job_inner(id).await?)
    }

    async fn all_root_job_ids(&self) -> StoreResult<Vec<JobId>> {
        Ok(self.all_root_job_ids_inner().await?)
    }

    async fn close(&self) -> StoreResult<()> {
        self.pool.close().await;
        info!("Closed postgres job store");
        Ok(())
    }
}
