//! Operation waiter — confirms deletes and re-admits nodes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use reaper_compute::{ComputeApi, Operation};
use reaper_core::Hostname;
use reaper_slurm::NodeStateDriver;

use crate::error::{SuspendError, SuspendResult};

/// Outcome of confirming a run's accepted deletes.
#[derive(Debug, Default)]
pub struct WaitReport {
    /// Instances confirmed deleted.
    pub confirmed: Vec<Hostname>,
    /// Confirmed nodes the scheduler accepted back into service.
    pub readmitted: Vec<Hostname>,
    pub failed: BTreeMap<Hostname, String>,
}

#[derive(Clone)]
pub struct OperationWaiter {
    compute: Arc<dyn ComputeApi>,
    poll_interval: Duration,
}

impl OperationWaiter {
    pub fn new(compute: Arc<dyn ComputeApi>, poll_interval: Duration) -> Self {
        Self {
            compute,
            poll_interval,
        }
    }

    /// Block until `operation` is done. Errors if the wait call fails or
    /// the operation finished with errors.
    pub async fn wait(&self, operation: &Operation) -> SuspendResult<Operation> {
        let mut current = operation.clone();
        while !current.is_done() {
            current = self.compute.wait_operation(&current).await?;
            if !current.is_done() {
                debug!(operation = %current.name, status = ?current.status, "operation still running");
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        match current.error_message() {
            Some(message) => Err(SuspendError::OperationFailed {
                name: current.name.clone(),
                message,
            }),
            None => Ok(current),
        }
    }

    /// Wait on each node's delete in turn, resuming the node as soon as its
    /// own operation succeeds. A failed wait leaves the node powered down.
    pub async fn confirm_and_readmit(
        &self,
        operations: &[(Hostname, Operation)],
        driver: &mut NodeStateDriver,
    ) -> WaitReport {
        let mut report = WaitReport::default();

        for (hostname, operation) in operations {
            match self.wait(operation).await {
                Ok(_) => {
                    debug!(node = %hostname, operation = %operation.name, "instance deleted");
                    report.confirmed.push(hostname.clone());
                    if driver.readmit(hostname).await {
                        report.readmitted.push(hostname.clone());
                    }
                }
                Err(e) => {
                    error!(node = %hostname, operation = %operation.name, error = %e, "delete did not complete, leaving node down");
                    report.failed.insert(hostname.clone(), e.to_string());
                }
            }
        }

        info!(
            confirmed = report.confirmed.len(),
            readmitted = report.readmitted.len(),
            failed = report.failed.len(),
            "delete operations settled"
        );
        report
    }
}
