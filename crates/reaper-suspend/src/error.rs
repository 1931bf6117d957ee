//! Suspend error types.

use thiserror::Error;

/// Errors that can occur during a suspend run.
///
/// Only hostlist expansion aborts a run. Everything else is scoped to one
/// node, batch, operation, or placement group and ends up in the report.
#[derive(Debug, Error)]
pub enum SuspendError {
    #[error("config error: {0}")]
    Config(#[from] reaper_core::ConfigError),

    #[error("scheduler error: {0}")]
    Slurm(#[from] reaper_slurm::SlurmError),

    #[error("compute error: {0}")]
    Compute(#[from] reaper_compute::ComputeError),

    #[error("inventory lookup for partition {partition} failed: {message}")]
    Lookup { partition: String, message: String },

    #[error("operation {name} failed: {message}")]
    OperationFailed { name: String, message: String },

    #[error("accelerator delete of {node} failed: {message}")]
    Accelerator { node: String, message: String },
}

pub type SuspendResult<T> = Result<T, SuspendError>;
