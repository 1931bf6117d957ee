//! Scheduler command error types.

use thiserror::Error;

/// Errors from invoking scheduler commands.
#[derive(Debug, Error)]
pub enum SlurmError {
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("hostlist expression expanded to no hosts: {0}")]
    EmptyHostlist(String),
}

pub type SlurmResult<T> = Result<T, SlurmError>;
