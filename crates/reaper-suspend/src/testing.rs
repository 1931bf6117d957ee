//! In-crate fakes for the compute API, the scheduler and the accelerator
//! deleter. Each records the calls it receives.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use reaper_compute::{
    BatchOutcome, ComputeApi, ComputeError, ComputeResult, DeleteRequest, InstanceRef, Operation,
    OperationError, OperationErrorItem, OperationStatus, RequestOutcome,
};
use reaper_core::{Hostname, ReaperConfig};
use reaper_slurm::{NodeStateCommand, SchedulerControl, SlurmError, SlurmResult};

use crate::accelerator::AcceleratorDeleter;
use crate::error::{SuspendError, SuspendResult};

pub fn test_config() -> ReaperConfig {
    ReaperConfig::from_toml_str(
        r#"
project = "hpc-project"
cluster_name = "cluster"

[suspend]
max_batch_requests = 1000
batch_pause = "0s"
operation_poll_interval = "0s"

[instance_defs.cluster-p1]
zone = "us-central1-a"
machine_type = "n1-standard-4"

[instance_defs.cluster-c2]
zone = "us-central1-b"
exclusive = true
enable_placement = true
machine_type = "c2-standard-60"

[instance_defs.cluster-spot]
region = "us-east1"
regional_capacity = true

[instance_defs.cluster-tpu]
zone = "us-central1-f"
tpu_type = "v3-8"
"#,
    )
    .unwrap()
}

// ── Compute ────────────────────────────────────────────────────────

#[derive(Default)]
struct ComputeCalls {
    batches: Vec<Vec<Hostname>>,
    list_calls: Vec<(String, String)>,
    waits: Vec<String>,
    wait_counts: HashMap<String, u32>,
    policy_deletes: Vec<(String, String)>,
    throttle_left: HashMap<Hostname, u32>,
}

pub struct FakeCompute {
    regional: HashMap<String, Vec<InstanceRef>>,
    failing_inventory: bool,
    failures: HashMap<Hostname, String>,
    failing_batches: HashSet<Hostname>,
    dropped: HashSet<Hostname>,
    wait_polls: u32,
    failed_operations: HashSet<String>,
    failed_policies: HashSet<String>,
    calls: Mutex<ComputeCalls>,
}

impl FakeCompute {
    pub fn new() -> Self {
        Self {
            regional: HashMap::new(),
            failing_inventory: false,
            failures: HashMap::new(),
            failing_batches: HashSet::new(),
            dropped: HashSet::new(),
            wait_polls: 1,
            failed_operations: HashSet::new(),
            failed_policies: HashSet::new(),
            calls: Mutex::new(ComputeCalls::default()),
        }
    }

    pub fn with_regional_instance(mut self, region: &str, name: &str, zone: &str) -> Self {
        self.regional
            .entry(region.to_string())
            .or_default()
            .push(InstanceRef {
                name: name.to_string(),
                zone: format!("https://www.googleapis.com/compute/v1/projects/hpc-project/zones/{zone}"),
                status: Some("RUNNING".into()),
            });
        self
    }

    pub fn with_failing_inventory(mut self) -> Self {
        self.failing_inventory = true;
        self
    }

    /// Throttle `host` for its first `rounds` submissions.
    pub fn throttle(mut self, host: &str, rounds: u32) -> Self {
        self.calls
            .get_mut()
            .unwrap()
            .throttle_left
            .insert(host.to_string(), rounds);
        self
    }

    pub fn fail(mut self, host: &str, message: &str) -> Self {
        self.failures.insert(host.to_string(), message.to_string());
        self
    }

    /// Reject, as a whole, any batch carrying `host`.
    pub fn fail_batch_containing(mut self, host: &str) -> Self {
        self.failing_batches.insert(host.to_string());
        self
    }

    /// Leave `host` out of the returned outcome map.
    pub fn drop_outcome(mut self, host: &str) -> Self {
        self.dropped.insert(host.to_string());
        self
    }

    /// Operations report done on their `polls`-th wait.
    pub fn with_wait_polls(mut self, polls: u32) -> Self {
        self.wait_polls = polls.max(1);
        self
    }

    /// The delete operation of `host` finishes with an error.
    pub fn fail_operation(mut self, host: &str) -> Self {
        self.failed_operations.insert(format!("op-{host}"));
        self
    }

    pub fn fail_policy(mut self, name: &str) -> Self {
        self.failed_policies.insert(name.to_string());
        self
    }

    pub fn batches(&self) -> Vec<Vec<Hostname>> {
        self.calls.lock().unwrap().batches.clone()
    }

    pub fn list_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().list_calls.clone()
    }

    pub fn waits(&self) -> Vec<String> {
        self.calls.lock().unwrap().waits.clone()
    }

    pub fn policy_deletes(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().policy_deletes.clone()
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn delete_instances(&self, batch: &[DeleteRequest]) -> ComputeResult<BatchOutcome> {
        let mut calls = self.calls.lock().unwrap();
        calls
            .batches
            .push(batch.iter().map(|r| r.hostname.clone()).collect());

        if batch.iter().any(|r| self.failing_batches.contains(&r.hostname)) {
            return Err(ComputeError::Api {
                status: 503,
                message: "backend unavailable".into(),
            });
        }

        let mut outcomes = BatchOutcome::new();
        for req in batch {
            if self.dropped.contains(&req.hostname) {
                continue;
            }
            let outcome = match calls.throttle_left.get_mut(&req.hostname) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    RequestOutcome::from_error("Quota exceeded for quota metric 'Queries'")
                }
                _ => match self.failures.get(&req.hostname) {
                    Some(message) => RequestOutcome::Failed(message.clone()),
                    None => RequestOutcome::Accepted(Operation {
                        name: format!("op-{}", req.hostname),
                        zone: Some(format!("zones/{}", req.zone)),
                        status: OperationStatus::Pending,
                        ..Operation::default()
                    }),
                },
            };
            outcomes.insert(req.hostname.clone(), outcome);
        }
        Ok(outcomes)
    }

    async fn wait_operation(&self, operation: &Operation) -> ComputeResult<Operation> {
        let mut calls = self.calls.lock().unwrap();
        calls.waits.push(operation.name.clone());
        let count = calls.wait_counts.entry(operation.name.clone()).or_default();
        *count += 1;

        let mut op = operation.clone();
        if *count < self.wait_polls {
            op.status = OperationStatus::Running;
            return Ok(op);
        }
        op.status = OperationStatus::Done;
        if self.failed_operations.contains(&op.name) {
            op.error = Some(OperationError {
                errors: vec![OperationErrorItem {
                    code: Some("RESOURCE_IN_USE".into()),
                    message: Some("instance is in use".into()),
                }],
            });
        }
        Ok(op)
    }

    async fn list_instances(&self, region: &str, name_prefix: &str) -> ComputeResult<Vec<InstanceRef>> {
        self.calls
            .lock()
            .unwrap()
            .list_calls
            .push((region.to_string(), name_prefix.to_string()));

        if self.failing_inventory {
            return Err(ComputeError::Api {
                status: 500,
                message: "internal error".into(),
            });
        }
        let prefix = format!("{name_prefix}-");
        Ok(self
            .regional
            .get(region)
            .map(|instances| {
                instances
                    .iter()
                    .filter(|inst| inst.name.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_resource_policy(&self, region: &str, name: &str) -> ComputeResult<Operation> {
        self.calls
            .lock()
            .unwrap()
            .policy_deletes
            .push((region.to_string(), name.to_string()));

        if self.failed_policies.contains(name) {
            return Err(ComputeError::Api {
                status: 404,
                message: format!("resource policy {name} was not found"),
            });
        }
        Ok(Operation {
            name: format!("op-{name}"),
            region: Some(format!("regions/{region}")),
            status: OperationStatus::Pending,
            ..Operation::default()
        })
    }
}

// ── Scheduler ──────────────────────────────────────────────────────

/// Expands comma-separated hostlists verbatim.
pub struct FakeScheduler {
    updates: Mutex<Vec<(String, NodeStateCommand, Option<String>)>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self {
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn updates(&self) -> Vec<(String, NodeStateCommand, Option<String>)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn resumed(&self) -> Vec<String> {
        self.updates()
            .into_iter()
            .filter(|(_, state, _)| *state == NodeStateCommand::Resume)
            .map(|(nodes, _, _)| nodes)
            .collect()
    }
}

#[async_trait]
impl SchedulerControl for FakeScheduler {
    async fn expand_hostlist(&self, expr: &str) -> SlurmResult<Vec<Hostname>> {
        let hosts: Vec<Hostname> = expr
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(String::from)
            .collect();
        if hosts.is_empty() {
            return Err(SlurmError::EmptyHostlist(expr.to_string()));
        }
        Ok(hosts)
    }

    async fn update_nodes(
        &self,
        nodes: &str,
        state: NodeStateCommand,
        reason: Option<&str>,
    ) -> SlurmResult<()> {
        self.updates
            .lock()
            .unwrap()
            .push((nodes.to_string(), state, reason.map(String::from)));
        Ok(())
    }
}

// ── Accelerator ────────────────────────────────────────────────────

pub struct FakeAccelerator {
    failing: HashSet<String>,
    deleted: Mutex<Vec<String>>,
}

impl FakeAccelerator {
    pub fn new() -> Self {
        Self {
            failing: HashSet::new(),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(mut self, node: &str) -> Self {
        self.failing.insert(node.to_string());
        self
    }

    /// Every node a delete was attempted for, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcceleratorDeleter for FakeAccelerator {
    async fn delete(&self, node: &str, _zone: &str) -> SuspendResult<()> {
        self.deleted.lock().unwrap().push(node.to_string());
        if self.failing.contains(node) {
            return Err(SuspendError::Accelerator {
                node: node.to_string(),
                message: "gcloud exited with exit status: 1".into(),
            });
        }
        Ok(())
    }
}
