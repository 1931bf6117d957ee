//! The suspend run: one scale-down event from hostlist to placement cleanup.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{error, info, warn};

use reaper_compute::{ComputeApi, DeleteRequest};
use reaper_core::{Hostname, Node, ReaperConfig, Trigger};
use reaper_slurm::{NodeStateDriver, SchedulerControl, Transition};

use crate::accelerator::{AcceleratorDeleter, AcceleratorPath};
use crate::batcher::{DeleteBatcher, select_for_deletion};
use crate::error::SuspendResult;
use crate::location::{Location, LocationResolver};
use crate::placement::{PlacementCleaner, needs_cleanup};
use crate::retry::RetryCoordinator;
use crate::waiter::OperationWaiter;

/// One invocation: a hostlist expression and what triggered it.
#[derive(Debug, Clone)]
pub struct SuspendRequest {
    pub nodelist: String,
    pub trigger: Trigger,
}

impl SuspendRequest {
    pub fn new(nodelist: impl Into<String>, job_id: Option<u64>) -> Self {
        Self {
            nodelist: nodelist.into(),
            trigger: Trigger::from_job_id(job_id),
        }
    }
}

/// What a run did, node by node.
#[derive(Debug, Default)]
pub struct SuspendReport {
    pub nodes: usize,
    /// Job-triggered run on a non-exclusive partition; nothing was touched.
    pub skipped_by_epilog: bool,
    /// Requests handed to the batcher.
    pub batched: usize,
    /// Nodes sent down the accelerator path.
    pub accelerator: usize,
    /// Instances confirmed deleted, batched first, then accelerator.
    pub deleted: Vec<Hostname>,
    pub readmitted: Vec<Hostname>,
    /// Regional nodes with no instance left to delete.
    pub absent: Vec<Hostname>,
    /// Exclusive nodes left to their job's own suspend.
    pub skipped: Vec<Hostname>,
    pub failed: BTreeMap<Hostname, String>,
    pub retry_rounds: u32,
    pub batch_sizes: Vec<usize>,
    pub placement_deleted: Vec<String>,
    pub placement_failed: BTreeMap<String, String>,
    pub transitions: Vec<Transition>,
}

impl SuspendReport {
    pub fn log_summary(&self) {
        if self.skipped_by_epilog {
            info!(nodes = self.nodes, "suspend skipped, partition is not exclusive");
            return;
        }
        info!(
            nodes = self.nodes,
            batched = self.batched,
            accelerator = self.accelerator,
            deleted = self.deleted.len(),
            readmitted = self.readmitted.len(),
            absent = self.absent.len(),
            skipped = self.skipped.len(),
            failed = self.failed.len(),
            retry_rounds = self.retry_rounds,
            batches = self.batch_sizes.len(),
            placement_deleted = self.placement_deleted.len(),
            placement_failed = self.placement_failed.len(),
            "suspend complete"
        );
        for (node, reason) in &self.failed {
            warn!(node = %node, %reason, "node left down");
        }
        for (group, reason) in &self.placement_failed {
            warn!(group = %group, %reason, "placement group not deleted");
        }
    }
}

pub struct Suspender {
    config: Arc<ReaperConfig>,
    compute: Arc<dyn ComputeApi>,
    scheduler: Arc<dyn SchedulerControl>,
    accelerator: Arc<dyn AcceleratorDeleter>,
}

impl Suspender {
    pub fn new(
        config: Arc<ReaperConfig>,
        compute: Arc<dyn ComputeApi>,
        scheduler: Arc<dyn SchedulerControl>,
        accelerator: Arc<dyn AcceleratorDeleter>,
    ) -> Self {
        Self {
            config,
            compute,
            scheduler,
            accelerator,
        }
    }

    /// Run one suspend. Only hostlist expansion and unparseable durations
    /// fail the run; every other failure is recorded in the report.
    pub async fn run(&self, request: &SuspendRequest) -> SuspendResult<SuspendReport> {
        let trigger = request.trigger;
        let pause = self.config.batch_pause()?;
        let poll_interval = self.config.operation_poll_interval()?;

        let mut hostnames = self.scheduler.expand_hostlist(&request.nodelist).await?;
        let mut seen = HashSet::new();
        hostnames.retain(|host| seen.insert(host.clone()));
        let mut report = SuspendReport {
            nodes: hostnames.len(),
            ..SuspendReport::default()
        };
        info!(
            nodelist = %request.nodelist,
            nodes = hostnames.len(),
            job_id = ?trigger.job_id(),
            "suspend started"
        );

        if self.epilog_handles(&hostnames, trigger) {
            report.skipped_by_epilog = true;
            return Ok(report);
        }

        let mut driver = NodeStateDriver::new(self.scheduler.clone());
        driver
            .take_offline(&request.nodelist, &hostnames, trigger)
            .await;

        // Classify.
        let mut accelerator_nodes: Vec<(Hostname, String)> = Vec::new();
        let mut standard: Vec<Node> = Vec::new();
        for hostname in &hostnames {
            let node = Node::new(hostname.as_str());
            match self.config.instance_def(&node.partition_id) {
                Ok(def) if def.is_accelerator() => match &def.zone {
                    Some(zone) => accelerator_nodes.push((node.hostname, zone.clone())),
                    None => {
                        error!(node = %node.hostname, "accelerator partition has no zone");
                        report
                            .failed
                            .insert(node.hostname, "accelerator partition has no zone".into());
                    }
                },
                Ok(_) => standard.push(node),
                Err(e) => {
                    error!(node = %node.hostname, error = %e, "cannot classify node");
                    report.failed.insert(node.hostname, e.to_string());
                }
            }
        }

        // Accelerator path.
        report.accelerator = accelerator_nodes.len();
        let accelerated = AcceleratorPath::new(self.accelerator.clone())
            .delete_all(&accelerator_nodes)
            .await;
        report.failed.extend(accelerated.failed);

        // Batched path.
        let (to_delete, skipped) = select_for_deletion(standard, trigger, &self.config);
        for node in skipped {
            info!(node = %node.hostname, "exclusive node left to its job's suspend");
            report.skipped.push(node.hostname);
        }

        let mut resolver = LocationResolver::new(self.compute.clone(), self.config.clone());
        let mut requests = Vec::with_capacity(to_delete.len());
        for node in &to_delete {
            match resolver.resolve(node).await {
                Ok(Location::Zone(zone)) => requests.push(DeleteRequest::new(node.hostname.as_str(), zone)),
                Ok(Location::Absent) => report.absent.push(node.hostname.clone()),
                Err(e) => {
                    error!(node = %node.hostname, error = %e, "cannot resolve node location");
                    report.failed.insert(node.hostname.clone(), e.to_string());
                }
            }
        }
        report.batched = requests.len();

        let batcher = DeleteBatcher::new(
            self.compute.clone(),
            self.config.suspend.max_batch_requests,
            pause,
        );
        let deletion = RetryCoordinator::new(&batcher).drain(requests).await;
        report.retry_rounds = deletion.rounds.saturating_sub(1);
        report.batch_sizes = deletion.batch_sizes;
        report.failed.extend(deletion.failed);

        // Confirm and re-admit.
        let waiter = OperationWaiter::new(self.compute.clone(), poll_interval);
        let settled = waiter
            .confirm_and_readmit(&deletion.operations, &mut driver)
            .await;
        report.deleted.extend(settled.confirmed);
        report.readmitted.extend(settled.readmitted);
        report.failed.extend(settled.failed);

        for hostname in accelerated.deleted {
            if driver.readmit(&hostname).await {
                report.readmitted.push(hostname.clone());
            }
            report.deleted.push(hostname);
        }

        // Placement groups.
        if let Some(job_id) = trigger.job_id() {
            self.clean_placement(job_id, &hostnames, waiter, &mut report)
                .await;
        }

        report.transitions = driver.history().to_vec();
        Ok(report)
    }

    /// A job-triggered suspend on a non-exclusive partition belongs to the
    /// scheduler's own epilog. Decided from the first node.
    fn epilog_handles(&self, hostnames: &[Hostname], trigger: Trigger) -> bool {
        if !trigger.is_job() {
            return false;
        }
        let Some(first) = hostnames.first() else {
            return false;
        };
        let node = Node::new(first.as_str());
        match self.config.instance_def(&node.partition_id) {
            Ok(def) if !def.exclusive => {
                info!(
                    node = %node.hostname,
                    partition = %node.partition_id,
                    "partition is not exclusive, leaving nodes to the epilog"
                );
                true
            }
            _ => false,
        }
    }

    async fn clean_placement(
        &self,
        job_id: u64,
        hostnames: &[Hostname],
        waiter: OperationWaiter,
        report: &mut SuspendReport,
    ) {
        let Some(first) = hostnames.first() else {
            return;
        };
        let node = Node::new(first.as_str());
        let Ok(def) = self.config.instance_def(&node.partition_id) else {
            return;
        };
        if !needs_cleanup(Trigger::JobCompletion(job_id), &self.config, def, hostnames.len()) {
            return;
        }
        let Some(region) = def.region() else {
            warn!(partition = %node.partition_id, "no region for placement cleanup");
            return;
        };

        let cleaner = PlacementCleaner::new(
            self.compute.clone(),
            waiter,
            &self.config.cluster_name,
            self.config.suspend.placement_max_members,
        );
        let placement = cleaner.cleanup(job_id, hostnames.len(), &region).await;
        report.placement_deleted = placement.deleted;
        report.placement_failed = placement.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAccelerator, FakeCompute, FakeScheduler, test_config};
    use reaper_slurm::{NodePhase, NodeStateCommand};

    struct Harness {
        compute: Arc<FakeCompute>,
        scheduler: Arc<FakeScheduler>,
        accelerator: Arc<FakeAccelerator>,
        suspender: Suspender,
    }

    fn harness(compute: FakeCompute, accelerator: FakeAccelerator) -> Harness {
        let compute = Arc::new(compute);
        let scheduler = Arc::new(FakeScheduler::new());
        let accelerator = Arc::new(accelerator);
        let suspender = Suspender::new(
            Arc::new(test_config()),
            compute.clone(),
            scheduler.clone(),
            accelerator.clone(),
        );
        Harness {
            compute,
            scheduler,
            accelerator,
            suspender,
        }
    }

    fn hostlist(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{prefix}-{i}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    #[tokio::test]
    async fn idle_pair_is_deleted_in_one_batch_and_readmitted() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-p1-0,cluster-p1-1", None))
            .await
            .unwrap();

        assert_eq!(
            h.compute.batches(),
            vec![vec!["cluster-p1-0", "cluster-p1-1"]]
        );
        assert_eq!(report.deleted, vec!["cluster-p1-0", "cluster-p1-1"]);
        assert_eq!(report.readmitted, vec!["cluster-p1-0", "cluster-p1-1"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.retry_rounds, 0);

        // Idle policy already powered them down: only resumes are issued.
        assert_eq!(h.scheduler.resumed(), vec!["cluster-p1-0", "cluster-p1-1"]);
        assert_eq!(h.scheduler.updates().len(), 2);
        for host in ["cluster-p1-0", "cluster-p1-1"] {
            let phases: Vec<NodePhase> = report
                .transitions
                .iter()
                .filter(|t| t.hostname == host)
                .map(|t| t.to)
                .collect();
            assert_eq!(phases, vec![NodePhase::PowerDown, NodePhase::Schedulable]);
        }
    }

    #[tokio::test]
    async fn quota_exceeded_node_is_retried_alone() {
        let h = harness(
            FakeCompute::new().throttle("cluster-p1-1", 1),
            FakeAccelerator::new(),
        );

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-p1-0,cluster-p1-1,cluster-p1-2", None))
            .await
            .unwrap();

        assert_eq!(
            h.compute.batches(),
            vec![
                vec!["cluster-p1-0", "cluster-p1-1", "cluster-p1-2"],
                vec!["cluster-p1-1"],
            ]
        );
        assert_eq!(report.retry_rounds, 1);
        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
    }

    #[tokio::test]
    async fn exclusive_job_cleans_placement_groups() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());
        let nodelist = hostlist("cluster-c2", 50);

        let report = h
            .suspender
            .run(&SuspendRequest::new(nodelist.clone(), Some(4242)))
            .await
            .unwrap();

        assert!(!report.skipped_by_epilog);
        assert_eq!(report.deleted.len(), 50);
        assert_eq!(
            h.compute.policy_deletes(),
            vec![
                ("us-central1".to_string(), "cluster-4242-1".to_string()),
                ("us-central1".to_string(), "cluster-4242-2".to_string()),
                ("us-central1".to_string(), "cluster-4242-3".to_string()),
            ]
        );
        assert_eq!(report.placement_deleted.len(), 3);

        let updates = h.scheduler.updates();
        assert_eq!(
            updates[0],
            (nodelist.clone(), NodeStateCommand::Down, Some("4242 finishing".to_string()))
        );
        assert_eq!(updates[1], (nodelist, NodeStateCommand::PowerDown, None));
        assert_eq!(h.scheduler.resumed().len(), 50);
    }

    #[tokio::test]
    async fn single_node_job_has_no_placement_cleanup() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        h.suspender
            .run(&SuspendRequest::new("cluster-c2-0", Some(7)))
            .await
            .unwrap();

        assert!(h.compute.policy_deletes().is_empty());
    }

    #[tokio::test]
    async fn tpu_node_takes_accelerator_path() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-tpu-0,cluster-p1-0", None))
            .await
            .unwrap();

        assert_eq!(h.accelerator.deleted(), vec!["cluster-tpu-0"]);
        assert_eq!(h.compute.batches(), vec![vec!["cluster-p1-0"]]);
        assert_eq!(report.accelerator, 1);
        assert_eq!(report.batched, 1);
        assert!(report.readmitted.contains(&"cluster-tpu-0".to_string()));
    }

    #[tokio::test]
    async fn failed_accelerator_delete_leaves_node_down() {
        let h = harness(
            FakeCompute::new(),
            FakeAccelerator::new().fail("cluster-tpu-0"),
        );

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-tpu-0", None))
            .await
            .unwrap();

        assert!(report.failed.contains_key("cluster-tpu-0"));
        assert!(report.readmitted.is_empty());
        assert!(h.scheduler.resumed().is_empty());
    }

    #[tokio::test]
    async fn job_on_shared_partition_is_left_to_epilog() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-p1-0,cluster-p1-1", Some(99)))
            .await
            .unwrap();

        assert!(report.skipped_by_epilog);
        assert!(h.compute.batches().is_empty());
        assert!(h.scheduler.updates().is_empty());
    }

    #[tokio::test]
    async fn idle_trigger_skips_exclusive_nodes() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-c2-0,cluster-p1-0", None))
            .await
            .unwrap();

        assert_eq!(report.skipped, vec!["cluster-c2-0"]);
        assert_eq!(h.compute.batches(), vec![vec!["cluster-p1-0"]]);
        assert_eq!(h.scheduler.resumed(), vec!["cluster-p1-0"]);
    }

    #[tokio::test]
    async fn absent_regional_node_is_not_deleted() {
        let h = harness(
            FakeCompute::new().with_regional_instance("us-east1", "cluster-spot-0", "us-east1-c"),
            FakeAccelerator::new(),
        );

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-spot-0,cluster-spot-1", None))
            .await
            .unwrap();

        assert_eq!(report.absent, vec!["cluster-spot-1"]);
        assert_eq!(h.compute.batches(), vec![vec!["cluster-spot-0"]]);
        assert_eq!(h.compute.list_calls().len(), 1);
    }

    #[tokio::test]
    async fn unknown_partition_is_recorded_as_failed() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("other-gpu-0,cluster-p1-0", None))
            .await
            .unwrap();

        assert!(report.failed.contains_key("other-gpu-0"));
        assert_eq!(h.compute.batches(), vec![vec!["cluster-p1-0"]]);
    }

    #[tokio::test]
    async fn failed_operation_is_never_readmitted() {
        let h = harness(
            FakeCompute::new().fail_operation("cluster-c2-1"),
            FakeAccelerator::new(),
        );

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-c2-0,cluster-c2-1", Some(3)))
            .await
            .unwrap();

        assert!(report.failed.contains_key("cluster-c2-1"));
        assert_eq!(h.scheduler.resumed(), vec!["cluster-c2-0"]);

        // Every recorded move is one of the legal transitions.
        let legal = [
            (NodePhase::Schedulable, NodePhase::AdminDown),
            (NodePhase::Schedulable, NodePhase::PowerDown),
            (NodePhase::AdminDown, NodePhase::PowerDown),
            (NodePhase::PowerDown, NodePhase::Schedulable),
        ];
        assert!(report.transitions.iter().all(|t| legal.contains(&(t.from, t.to))));
        assert!(
            !report
                .transitions
                .iter()
                .any(|t| t.hostname == "cluster-c2-1" && t.to == NodePhase::Schedulable)
        );
    }

    #[tokio::test]
    async fn empty_hostlist_fails_the_run() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let err = h.suspender.run(&SuspendRequest::new("", None)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn repeated_hostname_is_deleted_once() {
        let h = harness(FakeCompute::new(), FakeAccelerator::new());

        let report = h
            .suspender
            .run(&SuspendRequest::new("cluster-p1-0,cluster-p1-0", None))
            .await
            .unwrap();

        assert_eq!(report.nodes, 1);
        assert_eq!(h.compute.batches(), vec![vec!["cluster-p1-0"]]);
        assert_eq!(report.deleted, vec!["cluster-p1-0"]);
        assert_eq!(report.readmitted, vec!["cluster-p1-0"]);
        assert!(report.failed.is_empty());
    }
}
