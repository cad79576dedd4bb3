//! Job records and the inputs and outputs of queue operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, LeaseToken};

/// Lifecycle state of a job.
///
/// There is no failed state: a failed job is finished with a result payload
/// describing the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Finished,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A job as persisted by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub channel: String,
    /// Opaque input payload.
    pub args: serde_json::Value,
    /// Jobs that must finish before this one becomes ready, in enqueue order.
    pub dependencies: Vec<JobId>,
    /// Jobs that list this one as a dependency.
    #[serde(default)]
    pub dependants: Vec<JobId>,
    pub status: JobStatus,
    /// Opaque output payload, set once when the job finishes.
    pub result: Option<serde_json::Value>,
    pub queued_at: DateTime<Utc>,
    /// Start of the most recent claim.
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// How many times a claim of this job was given up or expired.
    #[serde(default)]
    pub retries: u32,
    /// Token of the current lease, present only while running.
    pub token: Option<LeaseToken>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl Job {
    /// A job nobody depends on.
    pub fn is_root(&self) -> bool {
        self.dependants.is_empty()
    }
}

/// Input for enqueuing a single job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub channel: String,
    pub args: serde_json::Value,
    pub dependencies: Vec<JobId>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            channel: channel.into(),
            args: serde_json::Value::Null,
            dependencies: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = JobId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }
}

/// Drop repeated ids while keeping first-seen order.
pub fn ordered_set(ids: &[JobId]) -> Vec<JobId> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(*id);
        }
    }
    out
}

/// A dependency inside a graph submitted with `enqueue_graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphDependency {
    /// A job that is already in the store.
    Existing(JobId),
    /// An earlier node of the same graph, by position.
    Node(usize),
}

/// One node of a graph submitted with `enqueue_graph`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub job_type: String,
    pub channel: String,
    pub args: serde_json::Value,
    pub dependencies: Vec<GraphDependency>,
}

impl GraphNode {
    pub fn new(job_type: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            channel: channel.into(),
            args: serde_json::Value::Null,
            dependencies: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn depends_on(mut self, dependency: GraphDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

/// Resolve the batch-local references of a graph into concrete job ids.
///
/// `ids[i]` is the id assigned to node `i`. A node may only reference nodes
/// that come before it, which keeps the batch acyclic. Existing ids are
/// returned unchecked; the store verifies them.
pub fn resolve_graph(
    nodes: &[GraphNode],
    ids: &[JobId],
) -> Result<Vec<Vec<JobId>>, String> {
    let mut resolved = Vec::with_capacity(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        let mut deps = Vec::with_capacity(node.dependencies.len());
        for dep in &node.dependencies {
            let id = match *dep {
                GraphDependency::Existing(id) => id,
                GraphDependency::Node(pos) if pos < index => ids[pos],
                GraphDependency::Node(pos) => {
                    return Err(format!(
                        "node {} depends on node {} which does not precede it",
                        index, pos
                    ));
                }
            };
            deps.push(id);
        }
        resolved.push(ordered_set(&deps));
    }
    Ok(resolved)
}

/// A successful claim handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: JobId,
    pub job_type: String,
    pub channel: String,
    pub args: serde_json::Value,
    pub dependencies: Vec<JobId>,
    pub token: LeaseToken,
}

impl Claim {
    pub fn from_job(job: &Job, token: LeaseToken) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type.clone(),
            channel: job.channel.clone(),
            args: job.args.clone(),
            dependencies: job.dependencies.clone(),
            token,
        }
    }
}

/// Reply to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Set once someone asked for the job to be cancelled. The worker is
    /// expected to abort and finish the job.
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Finished] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("failed".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_resolve_graph_maps_node_references() {
        let existing = JobId::new();
        let nodes = vec![
            GraphNode::new("depsolve", "x86_64"),
            GraphNode::new("manifest", "x86_64")
                .depends_on(GraphDependency::Node(0))
                .depends_on(GraphDependency::Existing(existing)),
        ];
        let ids = vec![JobId::new(), JobId::new()];

        let resolved = resolve_graph(&nodes, &ids).unwrap();
        assert!(resolved[0].is_empty());
        assert_eq!(resolved[1], vec![ids[0], existing]);
    }

    #[test]
    fn test_resolve_graph_rejects_forward_references() {
        let nodes = vec![
            GraphNode::new("a", "x86_64").depends_on(GraphDependency::Node(1)),
            GraphNode::new("b", "x86_64"),
        ];
        let ids = vec![JobId::new(), JobId::new()];
        assert!(resolve_graph(&nodes, &ids).is_err());

        let self_ref = vec![GraphNode::new("a", "x86_64").depends_on(GraphDependency::Node(0))];
        assert!(resolve_graph(&self_ref, &ids[..1]).is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
