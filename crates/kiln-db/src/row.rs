//! Row types and their conversion into domain records.

use chrono::{DateTime, Utc};
use kiln_core::{Job, JobId, JobStatus, LeaseToken};
use uuid::Uuid;

use crate::{DbError, DbResult};

/// Columns selected whenever a full job is read.
pub(crate) const JOB_COLUMNS: &str = "id, job_type, channel, args, result, status, token, \
     cancel_requested, retries, queued_at, started_at, finished_at";

/// Database row for jobs.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub job_type: String,
    pub channel: String,
    pub args: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub status: String,
    pub token: Option<Uuid>,
    pub cancel_requested: bool,
    pub retries: i32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// Build the domain record; edges are loaded separately.
    pub fn into_job(self, dependencies: Vec<Uuid>, dependants: Vec<Uuid>) -> DbResult<Job> {
        let status: JobStatus = self.status.parse().map_err(DbError::InvalidRow)?;
        let retries = u32::try_from(self.retries)
            .map_err(|_| DbError::InvalidRow(format!("negative retries on job {}", self.id)))?;

        Ok(Job {
            id: JobId::from_uuid(self.id),
            job_type: self.job_type,
            channel: self.channel,
            args: self.args,
            dependencies: dependencies.into_iter().map(JobId::from_uuid).collect(),
            dependants: dependants.into_iter().map(JobId::from_uuid).collect(),
            status,
            result: self.result,
            queued_at: self.queued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            retries,
            token: self.token.map(LeaseToken::from_uuid),
            cancel_requested: self.cancel_requested,
        })
    }
}

/// Status and lease columns, read under a row lock before a transition.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LeaseRow {
    pub status: String,
    pub token: Option<Uuid>,
    pub cancel_requested: bool,
}

impl LeaseRow {
    pub fn status(&self) -> DbResult<JobStatus> {
        self.status.parse().map_err(DbError::InvalidRow)
    }

    pub fn holds(&self, token: LeaseToken) -> DbResult<bool> {
        Ok(self.status()? == JobStatus::Running && self.token == Some(*token.as_uuid()))
    }
}

pub(crate) fn uuids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, retries: i32) -> JobRow {
        JobRow {
            id: Uuid::now_v7(),
            job_type: "depsolve".into(),
            channel: "x86_64".into(),
            args: serde_json::json!({"packages": ["bash"]}),
            result: None,
            status: status.into(),
            token: None,
            cancel_requested: false,
            retries,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_row_converts_edges_and_status() {
        let dep = Uuid::now_v7();
        let job = row("pending", 2).into_job(vec![dep], vec![]).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.dependencies, vec![JobId::from_uuid(dep)]);
        assert_eq!(job.retries, 2);
        assert!(job.is_root());
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let err = row("failed", 0).into_job(vec![], vec![]).unwrap_err();
        assert!(matches!(err, DbError::InvalidRow(_)));
    }

    #[test]
    fn test_lease_row_checks_token_and_status() {
        let token = LeaseToken::generate();
        let running = LeaseRow {
            status: "running".into(),
            token: Some(*token.as_uuid()),
            cancel_requested: false,
        };
        assert!(running.holds(token).unwrap());
        assert!(!running.holds(LeaseToken::generate()).unwrap());

        let pending = LeaseRow {
            status: "pending".into(),
            token: None,
            cancel_requested: false,
        };
        assert!(!pending.holds(token).unwrap());
    }
}
