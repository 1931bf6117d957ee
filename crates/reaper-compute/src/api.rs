//! The compute provider seam.

use async_trait::async_trait;

use crate::error::ComputeResult;
use crate::types::{BatchOutcome, DeleteRequest, InstanceRef, Operation};

/// Provider calls made by a suspend run. Implementations are bound to one
/// project.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Submit a batch of instance deletes in one round-trip.
    ///
    /// Every request in `batch` gets an entry in the returned map. `Err`
    /// means the batch as a whole could not be submitted.
    async fn delete_instances(&self, batch: &[DeleteRequest]) -> ComputeResult<BatchOutcome>;

    /// Wait on an operation. May return before the operation is done;
    /// callers re-poll until [`Operation::is_done`].
    async fn wait_operation(&self, operation: &Operation) -> ComputeResult<Operation>;

    /// List instances in `region` whose names start with `<name_prefix>-`.
    async fn list_instances(&self, region: &str, name_prefix: &str)
        -> ComputeResult<Vec<InstanceRef>>;

    /// Delete a regional resource policy (placement group).
    async fn delete_resource_policy(&self, region: &str, name: &str) -> ComputeResult<Operation>;
}
