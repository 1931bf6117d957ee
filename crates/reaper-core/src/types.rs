//! Shared types used across Reaper crates.

use serde::{Deserialize, Serialize};

/// Scheduler hostname of a cloud node. Unique within the cluster.
pub type Hostname = String;

/// Partition (nodeset) id: the hostname minus its trailing `-<index>`.
///
/// `cluster-p1-0` → `cluster-p1`. A name without `-` is its own id.
pub fn partition_id(hostname: &str) -> &str {
    match hostname.rsplit_once('-') {
        Some((pid, _index)) => pid,
        None => hostname,
    }
}

/// What caused the scheduler to invoke a suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// The scheduler's idle policy powered the nodes down.
    Idle,
    /// The job owning an exclusive allocation finished.
    JobCompletion(u64),
}

impl Trigger {
    /// A missing or zero job id means the idle policy fired.
    pub fn from_job_id(job_id: Option<u64>) -> Self {
        match job_id {
            Some(id) if id != 0 => Trigger::JobCompletion(id),
            _ => Trigger::Idle,
        }
    }

    pub fn job_id(&self) -> Option<u64> {
        match self {
            Trigger::Idle => None,
            Trigger::JobCompletion(id) => Some(*id),
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, Trigger::JobCompletion(_))
    }
}

/// A node being decommissioned during one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub hostname: Hostname,
    pub partition_id: String,
}

impl Node {
    pub fn new(hostname: impl Into<Hostname>) -> Self {
        let hostname = hostname.into();
        let partition_id = partition_id(&hostname).to_string();
        Self {
            hostname,
            partition_id,
        }
    }
}

/// Number of placement groups needed for `nodes` members: ceil(nodes / max).
pub fn placement_group_count(nodes: usize, max_members: usize) -> usize {
    if max_members == 0 {
        return 0;
    }
    nodes.div_ceil(max_members)
}

/// Deterministic placement group names for a job, indexed from 1.
pub fn placement_group_names(
    cluster_name: &str,
    job_id: u64,
    nodes: usize,
    max_members: usize,
) -> Vec<String> {
    (1..=placement_group_count(nodes, max_members))
        .map(|index| format!("{cluster_name}-{job_id}-{index}"))
        .collect()
}
