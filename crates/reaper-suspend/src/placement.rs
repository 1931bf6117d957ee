//! Placement cleaner — removes a finished job's placement groups.
//!
//! Placement groups are created by the resume path with deterministic
//! names (`{cluster}-{job_id}-{index}`), one per `placement_max_members`
//! nodes, so cleanup can recompute them from the job id and node count
//! alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use reaper_compute::{ComputeApi, Operation};
use reaper_core::{InstanceDef, ReaperConfig, Trigger, placement_group_names};

use crate::waiter::OperationWaiter;

/// Whether a run has placement groups to clean up.
pub fn needs_cleanup(
    trigger: Trigger,
    config: &ReaperConfig,
    def: &InstanceDef,
    node_count: usize,
) -> bool {
    trigger.is_job() && config.placement_enabled(def) && node_count > 1
}

#[derive(Debug, Default)]
pub struct PlacementReport {
    pub deleted: Vec<String>,
    pub failed: BTreeMap<String, String>,
}

pub struct PlacementCleaner {
    compute: Arc<dyn ComputeApi>,
    waiter: OperationWaiter,
    cluster_name: String,
    max_members: usize,
}

impl PlacementCleaner {
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        waiter: OperationWaiter,
        cluster_name: &str,
        max_members: usize,
    ) -> Self {
        Self {
            compute,
            waiter,
            cluster_name: cluster_name.to_string(),
            max_members,
        }
    }

    /// Delete every placement group of `job_id`, then wait for all of
    /// them. A failure on one group never stops the others.
    pub async fn cleanup(&self, job_id: u64, node_count: usize, region: &str) -> PlacementReport {
        let names = placement_group_names(&self.cluster_name, job_id, node_count, self.max_members);
        let mut report = PlacementReport::default();
        let mut pending: Vec<(String, Operation)> = Vec::with_capacity(names.len());

        for name in names {
            match self.compute.delete_resource_policy(region, &name).await {
                Ok(op) => {
                    debug!(group = %name, operation = %op.name, "placement group delete issued");
                    pending.push((name, op));
                }
                Err(e) => {
                    error!(group = %name, error = %e, "placement group delete failed");
                    report.failed.insert(name, e.to_string());
                }
            }
        }

        for (name, op) in pending {
            match self.waiter.wait(&op).await {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    error!(group = %name, error = %e, "placement group delete did not complete");
                    report.failed.insert(name, e.to_string());
                }
            }
        }

        info!(
            job_id,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "placement groups cleaned up"
        );
        report
    }
}
