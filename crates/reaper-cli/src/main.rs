//! reaper-suspend — the scheduler's suspend program.
//!
//! Invoked by the scheduler with a hostlist expression and, for
//! job-completion suspends, the job id. Exits zero once the run's summary
//! is logged, whatever happened to individual nodes.
//!
//! # Usage
//!
//! ```text
//! reaper-suspend cluster-p1-[0-3]
//! reaper-suspend cluster-c2-[0-49] 4242 --config /etc/reaper/config.toml
//! ```
//!
//! When run as an epilog, `SLURM_JOB_NODELIST` and `SLURM_JOB_ID` from the
//! environment are appended to the arguments. Only the first two
//! positionals are read; anything after them is ignored.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use reaper_compute::GceCompute;
use reaper_core::ReaperConfig;
use reaper_slurm::Scontrol;
use reaper_suspend::{GcloudTpuDeleter, SuspendRequest, Suspender};

const LOG_FILE: &str = "reaper-suspend.log";

#[derive(Parser, Debug)]
#[command(name = "reaper-suspend", about = "Delete suspended cloud nodes", version)]
struct Cli {
    /// Hostlist expression of the nodes to suspend, then the id of the
    /// finished job (absent or 0 for an idle suspend).
    #[arg(required = true, value_name = "NODES [JOB_ID]")]
    args: Vec<String>,

    /// Cluster configuration file.
    #[arg(long, default_value = "/etc/reaper/config.toml")]
    config: PathBuf,

    /// Force debug logging.
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn nodes(&self) -> anyhow::Result<&str> {
        self.args
            .first()
            .map(String::as_str)
            .context("missing hostlist argument")
    }

    fn job_id(&self) -> anyhow::Result<Option<u64>> {
        self.args
            .get(1)
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("invalid job id {raw:?}"))
            })
            .transpose()
    }
}

/// Append the job's node list and id, as an epilog sees them.
fn with_job_env(
    mut args: Vec<OsString>,
    nodelist: Option<OsString>,
    job_id: Option<OsString>,
) -> Vec<OsString> {
    if let Some(nodelist) = nodelist {
        args.push(nodelist);
        args.extend(job_id);
    }
    args
}

fn env_filter(debug: bool) -> EnvFilter {
    if debug {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reaper=debug"))
}

fn open_log_file(dir: &Path) -> anyhow::Result<File> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let path = dir.join(LOG_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn init_tracing(debug: bool, log_dir: Option<&Path>) -> anyhow::Result<()> {
    match log_dir {
        Some(dir) => {
            let file = open_log_file(dir)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(debug))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(debug))
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = with_job_env(
        std::env::args_os().collect(),
        std::env::var_os("SLURM_JOB_NODELIST"),
        std::env::var_os("SLURM_JOB_ID"),
    );
    let cli = Cli::parse_from(args);

    let config = ReaperConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_tracing(cli.debug, config.log_dir.as_deref())?;
    debug!(config = %cli.config.display(), project = %config.project, "config loaded");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: ReaperConfig) -> anyhow::Result<()> {
    let compute = match &config.google_app_cred_path {
        Some(key) => {
            debug!(key = %key.display(), "using service-account credentials");
            GceCompute::with_service_account(config.compute_endpoint(), &config.project, key)?
        }
        None => GceCompute::new(config.compute_endpoint(), &config.project)?,
    };
    let compute = Arc::new(compute);
    let scheduler = Arc::new(Scontrol::new(config.scontrol_path()));
    let accelerator = Arc::new(GcloudTpuDeleter::new(&config.suspend.tpu_delete_command));

    let suspender = Suspender::new(Arc::new(config), compute, scheduler, accelerator);
    let request = SuspendRequest::new(cli.nodes()?, cli.job_id()?);

    let report = suspender
        .run(&request)
        .await
        .with_context(|| format!("suspending {}", request.nodelist))?;
    report.log_summary();
    info!("suspend finished");
    Ok(())
}
