//! Reaper suspend — the scale-down control loop.
//!
//! A run takes nodes out of service, deletes their instances (batched and
//! throttle-aware for ordinary VMs, one by one for accelerator VMs), waits
//! for every delete to settle, re-admits the nodes whose instances are
//! confirmed gone, and finally removes the job's placement groups.
//!
//! ```text
//! expand hostlist ─▶ take offline ─▶ classify ─┬─▶ accelerator path ───────────────┐
//!                                               └─▶ resolve ─▶ batch ─▶ retry ─▶ wait ┴─▶ readmit ─▶ placement
//! ```

pub mod accelerator;
pub mod batcher;
pub mod error;
pub mod location;
pub mod placement;
pub mod retry;
pub mod suspend;
pub mod waiter;

#[cfg(test)]
mod testing;

pub use accelerator::{AcceleratorDeleter, AcceleratorPath, AcceleratorReport, GcloudTpuDeleter};
pub use batcher::{DeleteBatcher, RetryQueue, RoundOutcome, select_for_deletion};
pub use error::{SuspendError, SuspendResult};
pub use location::{Location, LocationResolver};
pub use placement::{PlacementCleaner, PlacementReport, needs_cleanup};
pub use retry::{DeletionSummary, RetryCoordinator};
pub use suspend::{SuspendReport, SuspendRequest, Suspender};
pub use waiter::{OperationWaiter, WaitReport};
