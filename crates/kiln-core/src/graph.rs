//! In-memory dependency graph index.
//!
//! Tracks edges in both directions together with each job's status so the
//! store can answer which jobs are ready, which jobs are roots, and which jobs
//! a delete of a root job sweeps away.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::JobId;
use crate::job::JobStatus;

#[derive(Debug, Clone)]
struct Node {
    status: JobStatus,
    dependencies: Vec<JobId>,
    dependants: Vec<JobId>,
}

/// Adjacency index over every job in a store.
#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    nodes: HashMap<JobId, Node>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Add a job whose dependencies must already be indexed.
    ///
    /// Returns the first unknown dependency on failure and leaves the index
    /// untouched. Because edges can only point at jobs that already exist, the
    /// graph can never contain a cycle.
    pub fn insert(
        &mut self,
        id: JobId,
        status: JobStatus,
        dependencies: &[JobId],
    ) -> Result<(), JobId> {
        if let Some(missing) = dependencies.iter().find(|d| !self.nodes.contains_key(d)) {
            return Err(*missing);
        }
        self.restore(id, status, dependencies);
        Ok(())
    }

    /// Add a job without checking its dependencies.
    ///
    /// Used when rebuilding the index from persisted records, where a
    /// dependency may have been lost to a corrupt record. Such a job is never
    /// ready.
    pub fn restore(&mut self, id: JobId, status: JobStatus, dependencies: &[JobId]) {
        for dep in dependencies {
            if let Some(node) = self.nodes.get_mut(dep) {
                if !node.dependants.contains(&id) {
                    node.dependants.push(id);
                }
            }
        }

        // A dependant restored before this job already recorded its edge.
        let dependants = self
            .nodes
            .iter()
            .filter(|(_, node)| node.dependencies.contains(&id))
            .map(|(other, _)| *other)
            .collect();

        self.nodes.insert(
            id,
            Node {
                status,
                dependencies: dependencies.to_vec(),
                dependants,
            },
        );
    }

    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// Returns false if the job is unknown.
    pub fn set_status(&mut self, id: &JobId, status: JobStatus) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.status = status;
                true
            }
            None => false,
        }
    }

    pub fn dependencies(&self, id: &JobId) -> &[JobId] {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Jobs depending on `id`, sorted by id.
    pub fn dependants(&self, id: &JobId) -> Vec<JobId> {
        let mut out = self
            .nodes
            .get(id)
            .map(|n| n.dependants.clone())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Whether every dependency of `id` has finished.
    ///
    /// A dependency missing from the index counts as unfinished.
    pub fn dependencies_finished(&self, id: &JobId) -> bool {
        self.dependencies(id)
            .iter()
            .all(|dep| self.status(dep) == Some(JobStatus::Finished))
    }

    /// A pending job whose dependencies have all finished.
    pub fn is_ready(&self, id: &JobId) -> bool {
        self.status(id) == Some(JobStatus::Pending) && self.dependencies_finished(id)
    }

    /// Jobs nobody depends on, sorted by id.
    pub fn roots(&self) -> Vec<JobId> {
        let mut roots: Vec<JobId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.dependants.is_empty())
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        roots
    }

    /// Jobs removed by deleting `root`, dependants before their dependencies.
    ///
    /// A dependency is swept only once every job depending on it has been
    /// swept, so dependencies shared with a surviving job stay. Returns an
    /// empty list for an unknown id.
    pub fn deletion_set(&self, root: &JobId) -> Vec<JobId> {
        if !self.nodes.contains_key(root) {
            return Vec::new();
        }

        let mut swept: Vec<JobId> = vec![*root];
        let mut seen: HashSet<JobId> = HashSet::from([*root]);
        let mut candidates: VecDeque<JobId> = self.dependencies(root).iter().copied().collect();

        while let Some(candidate) = candidates.pop_front() {
            if seen.contains(&candidate) {
                continue;
            }
            let Some(node) = self.nodes.get(&candidate) else {
                continue;
            };
            // Revisited when its last remaining dependant gets swept.
            if !node.dependants.iter().all(|d| seen.contains(d)) {
                continue;
            }
            seen.insert(candidate);
            swept.push(candidate);
            candidates.extend(node.dependencies.iter().copied());
        }

        swept
    }

    /// Drop a job and every edge touching it.
    pub fn remove(&mut self, id: &JobId) -> bool {
        let Some(node) = self.nodes.remove(id) else {
            return false;
        };
        for dep in &node.dependencies {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.dependants.retain(|d| d != id);
            }
        }
        for dependant in &node.dependants {
            if let Some(dependant_node) = self.nodes.get_mut(dependant) {
                dependant_node.dependencies.retain(|d| d != id);
            }
        }
        true
    }
}
