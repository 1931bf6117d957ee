//! Retry coordinator — resubmits throttled deletes until none remain.
//!
//! Each round submits exactly the hostnames the previous round queued for
//! retry, reusing their already-resolved requests. There is no round
//! ceiling: throttling is expected to clear, and a run stuck here is
//! killed by its caller like any other hung suspend.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use reaper_compute::{DeleteRequest, Operation};
use reaper_core::Hostname;

use crate::batcher::DeleteBatcher;

/// Aggregate of all rounds.
#[derive(Debug, Default)]
pub struct DeletionSummary {
    /// Accepted deletes, in acceptance order. One entry per hostname.
    pub operations: Vec<(Hostname, Operation)>,
    pub failed: BTreeMap<Hostname, String>,
    pub rounds: u32,
    /// Size of every batch submitted across all rounds.
    pub batch_sizes: Vec<usize>,
}

pub struct RetryCoordinator<'a> {
    batcher: &'a DeleteBatcher,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(batcher: &'a DeleteBatcher) -> Self {
        Self { batcher }
    }

    pub async fn drain(&self, requests: Vec<DeleteRequest>) -> DeletionSummary {
        let mut summary = DeletionSummary::default();
        if requests.is_empty() {
            return summary;
        }

        let by_host: HashMap<Hostname, DeleteRequest> = requests
            .iter()
            .map(|req| (req.hostname.clone(), req.clone()))
            .collect();
        let mut pending = requests;

        loop {
            if summary.rounds > 0 && !self.batcher.pause().is_zero() {
                tokio::time::sleep(self.batcher.pause()).await;
            }
            summary.rounds += 1;

            let mut round = self.batcher.submit(&pending).await;
            summary.operations.append(&mut round.accepted);
            summary.failed.extend(round.failed);
            summary.batch_sizes.append(&mut round.batch_sizes);

            if round.retry.is_empty() {
                break;
            }

            let retry = round.retry.drain();
            debug!(
                round = summary.rounds,
                count = retry.len(),
                nodes = %retry.join(","),
                "retrying throttled deletes"
            );
            pending = retry
                .iter()
                .filter_map(|host| by_host.get(host).cloned())
                .collect();
        }

        info!(
            rounds = summary.rounds,
            accepted = summary.operations.len(),
            failed = summary.failed.len(),
            "delete rounds complete"
        );
        summary
    }
}
