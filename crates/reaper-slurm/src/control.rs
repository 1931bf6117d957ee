//! Scheduler command interface.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use reaper_core::Hostname;

use crate::error::{SlurmError, SlurmResult};

/// Target states accepted by `scontrol update node=… state=…`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStateCommand {
    Down,
    PowerDown,
    Resume,
}

impl NodeStateCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStateCommand::Down => "down",
            NodeStateCommand::PowerDown => "power_down",
            NodeStateCommand::Resume => "resume",
        }
    }
}

/// The scheduler's serialized command interface. Each call is atomic from
/// the caller's point of view.
#[async_trait]
pub trait SchedulerControl: Send + Sync {
    /// Expand a compressed hostlist expression, preserving order.
    async fn expand_hostlist(&self, expr: &str) -> SlurmResult<Vec<Hostname>>;

    /// Set the state of every node matched by `nodes`.
    async fn update_nodes(
        &self,
        nodes: &str,
        state: NodeStateCommand,
        reason: Option<&str>,
    ) -> SlurmResult<()>;
}

/// `scontrol`-backed scheduler control.
#[derive(Debug, Clone)]
pub struct Scontrol {
    program: PathBuf,
}

impl Scontrol {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run(&self, args: &[String]) -> SlurmResult<String> {
        let command = format!("{} {}", self.program.display(), args.join(" "));
        debug!(%command, "running scheduler command");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|source| SlurmError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(SlurmError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SchedulerControl for Scontrol {
    async fn expand_hostlist(&self, expr: &str) -> SlurmResult<Vec<Hostname>> {
        let stdout = self
            .run(&["show".into(), "hostnames".into(), expr.to_string()])
            .await?;
        let hosts: Vec<Hostname> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if hosts.is_empty() {
            return Err(SlurmError::EmptyHostlist(expr.to_string()));
        }
        Ok(hosts)
    }

    async fn update_nodes(
        &self,
        nodes: &str,
        state: NodeStateCommand,
        reason: Option<&str>,
    ) -> SlurmResult<()> {
        let mut args = vec![
            "update".to_string(),
            format!("node={nodes}"),
            format!("state={}", state.as_str()),
        ];
        if let Some(reason) = reason {
            args.push(format!("reason={reason}"));
        }
        self.run(&args).await.map(|_| ())
    }
}
