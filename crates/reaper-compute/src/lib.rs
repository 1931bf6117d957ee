//! reaper-compute — the cloud side of a suspend run.
//!
//! [`ComputeApi`] is the seam between the decommission loop and the
//! provider. It exposes exactly the four calls a run needs:
//!
//! ```text
//! delete_instances        one batch, one multipart request, outcome per hostname
//! wait_operation          long-running operation wait (may return early)
//! list_instances          regional inventory lookup by name prefix
//! delete_resource_policy  placement group removal
//! ```
//!
//! [`GceCompute`] implements it against the Compute Engine v1 REST API.
//! Per-request failures are classified as throttled or permanent by their
//! error text; only a failure of the whole call is returned as `Err`.

pub mod api;
mod batch;
pub mod error;
pub mod gce;
pub mod types;

pub use api::ComputeApi;
pub use error::{ComputeError, ComputeResult, is_throttling};
pub use gce::GceCompute;
pub use types::*;
