//! Delete batcher — packs instance deletes into capped batches.
//!
//! Batches are submitted one after another with a fixed pause in between,
//! trading latency for staying inside per-minute provider quotas. Each
//! request ends a round in exactly one of three places: accepted (with an
//! operation), the retry queue (throttled), or the failure list.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use reaper_compute::{ComputeApi, DeleteRequest, Operation, RequestOutcome};
use reaper_core::{Hostname, Node, ReaperConfig, Trigger};

/// Throttled hostnames awaiting the next round. Insertion-ordered, no
/// duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryQueue {
    hosts: Vec<Hostname>,
    seen: HashSet<Hostname>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a hostname. Returns false if it was already queued.
    pub fn push(&mut self, hostname: Hostname) -> bool {
        if !self.seen.insert(hostname.clone()) {
            return false;
        }
        self.hosts.push(hostname);
        true
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.seen.contains(hostname)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hostnames(&self) -> &[Hostname] {
        &self.hosts
    }

    /// Empty the queue, yielding its hostnames in order.
    pub fn drain(&mut self) -> Vec<Hostname> {
        self.seen.clear();
        std::mem::take(&mut self.hosts)
    }
}

/// Result of submitting one round of requests.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    pub accepted: Vec<(Hostname, Operation)>,
    pub retry: RetryQueue,
    pub failed: Vec<(Hostname, String)>,
    /// Size of every batch submitted, in order.
    pub batch_sizes: Vec<usize>,
}

/// Split nodes into those to delete and those to leave alone.
///
/// Exclusive-partition nodes are only deleted on a job-completion trigger;
/// on an idle trigger the job's own suspend has already removed them.
pub fn select_for_deletion(
    nodes: Vec<Node>,
    trigger: Trigger,
    config: &ReaperConfig,
) -> (Vec<Node>, Vec<Node>) {
    nodes.into_iter().partition(|node| {
        let exclusive = config
            .instance_def(&node.partition_id)
            .map(|def| def.exclusive)
            .unwrap_or(false);
        trigger.is_job() || !exclusive
    })
}

pub struct DeleteBatcher {
    compute: Arc<dyn ComputeApi>,
    max_batch_requests: usize,
    pause: Duration,
}

impl DeleteBatcher {
    pub fn new(compute: Arc<dyn ComputeApi>, max_batch_requests: usize, pause: Duration) -> Self {
        Self {
            compute,
            max_batch_requests: max_batch_requests.max(1),
            pause,
        }
    }

    /// Pause between batches.
    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Chunk requests into batches of at most `max_batch_requests`.
    pub fn plan<'a>(&self, requests: &'a [DeleteRequest]) -> Vec<&'a [DeleteRequest]> {
        requests.chunks(self.max_batch_requests).collect()
    }

    /// Submit every request once, batch by batch.
    pub async fn submit(&self, requests: &[DeleteRequest]) -> RoundOutcome {
        let batches = self.plan(requests);
        let mut round = RoundOutcome::default();

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 && !self.pause.is_zero() {
                debug!(pause = ?self.pause, "pausing between batches");
                tokio::time::sleep(self.pause).await;
            }

            round.batch_sizes.push(batch.len());
            info!(batch = index + 1, of = batches.len(), requests = batch.len(), "submitting delete batch");

            let mut outcomes = match self.compute.delete_instances(batch).await {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    error!(batch = index + 1, error = %e, "delete batch failed");
                    for req in batch.iter() {
                        round
                            .failed
                            .push((req.hostname.clone(), format!("batch submission failed: {e}")));
                    }
                    continue;
                }
            };

            for req in batch.iter() {
                match outcomes.remove(&req.hostname) {
                    Some(RequestOutcome::Accepted(op)) => {
                        debug!(node = %req.hostname, operation = %op.name, "delete accepted");
                        round.accepted.push((req.hostname.clone(), op));
                    }
                    Some(RequestOutcome::Throttled(message)) => {
                        warn!(node = %req.hostname, %message, "delete throttled, will retry");
                        round.retry.push(req.hostname.clone());
                    }
                    Some(RequestOutcome::Failed(message)) => {
                        error!(node = %req.hostname, %message, "delete failed");
                        round.failed.push((req.hostname.clone(), message));
                    }
                    None => {
                        error!(node = %req.hostname, "no outcome returned for delete request");
                        round
                            .failed
                            .push((req.hostname.clone(), "no outcome returned".to_string()));
                    }
                }
            }
        }

        round
    }
}
