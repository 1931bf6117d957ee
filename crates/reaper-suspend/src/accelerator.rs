//! Accelerator path — one-at-a-time TPU VM deletion through `gcloud`.
//!
//! TPU VMs are not covered by the batched instance API. Each is deleted by
//! a synchronous `gcloud alpha compute tpus tpu-vm delete`, which needs a
//! terminal on stderr to block until the TPU is gone and aborts if stdin
//! is closed mid-prompt, so it runs with a pty and a null stdin.

use std::collections::BTreeMap;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use reaper_core::Hostname;

use crate::error::{SuspendError, SuspendResult};

/// How long to keep draining the pty after the command exits.
const PTY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll slice of the drain loop, in milliseconds.
const DRAIN_POLL_MS: libc::c_int = 100;

/// Deletes a single accelerator node.
#[async_trait]
pub trait AcceleratorDeleter: Send + Sync {
    async fn delete(&self, node: &str, zone: &str) -> SuspendResult<()>;
}

/// `gcloud`-backed TPU VM deletion.
#[derive(Debug, Clone)]
pub struct GcloudTpuDeleter {
    program: PathBuf,
    drain_timeout: Duration,
}

impl GcloudTpuDeleter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            drain_timeout: PTY_DRAIN_TIMEOUT,
        }
    }

    /// Bound on reading leftover pty output once the command has exited.
    /// Background children that inherited the terminal can hold it open.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn args(node: &str, zone: &str) -> Vec<String> {
        vec![
            "alpha".into(),
            "compute".into(),
            "tpus".into(),
            "tpu-vm".into(),
            "delete".into(),
            node.to_string(),
            format!("--zone={zone}"),
            "--quiet".into(),
        ]
    }
}

#[async_trait]
impl AcceleratorDeleter for GcloudTpuDeleter {
    async fn delete(&self, node: &str, zone: &str) -> SuspendResult<()> {
        let accel_err = |message: String| SuspendError::Accelerator {
            node: node.to_string(),
            message,
        };

        let (master, slave) = open_pty().map_err(|e| accel_err(format!("openpty: {e}")))?;

        // The command (and with it our copy of the pty slave) is dropped
        // right after spawn so the master sees EOF when the child exits.
        let child = {
            let mut cmd = Command::new(&self.program);
            cmd.args(Self::args(node, zone))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::from(slave));
            cmd.spawn()
                .map_err(|e| accel_err(format!("spawn {}: {e}", self.program.display())))?
        };

        let stop = Arc::new(AtomicBool::new(false));
        let mut transcript = tokio::task::spawn_blocking({
            let stop = stop.clone();
            move || drain_pty(master, &stop)
        });

        let waited = child.wait_with_output().await;

        let drained = tokio::time::timeout(self.drain_timeout, &mut transcript).await;
        let transcript = match drained {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => {
                warn!(node, "pty still open after gcloud exited; abandoning its output");
                stop.store(true, Ordering::Relaxed);
                transcript.await.unwrap_or_default()
            }
        };
        let output = waited.map_err(|e| accel_err(format!("wait: {e}")))?;
        debug!(node, output = %transcript.trim(), "gcloud tpu delete finished");

        if !output.status.success() {
            let detail = transcript
                .lines()
                .rev()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("no output");
            return Err(accel_err(format!("gcloud exited with {}: {detail}", output.status)));
        }
        Ok(())
    }
}

/// Read the pty master until the slave side closes or `stop` is raised.
fn drain_pty(master: OwnedFd, stop: &AtomicBool) -> String {
    let mut master = std::fs::File::from(master);
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        let mut pfd = libc::pollfd {
            fd: master.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: a single valid pollfd for a descriptor we own.
        let ready = unsafe { libc::poll(&mut pfd, 1, DRAIN_POLL_MS) };
        if ready < 0 {
            if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }
        if ready == 0 {
            continue;
        }
        // A pty master reads EIO once the slave side closes.
        match master.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Allocate a pseudo-terminal pair, master marked close-on-exec.
fn open_pty() -> std::io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    // SAFETY: openpty only writes the two out-params; null name, termios and
    // winsize are permitted.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just returned by openpty and have no
    // other owner.
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        libc::fcntl(
            master.as_raw_fd(),
            libc::F_SETFD,
            libc::FD_CLOEXEC,
        );
    }
    Ok((master, slave))
}

/// Result of running the accelerator path.
#[derive(Debug, Default)]
pub struct AcceleratorReport {
    pub deleted: Vec<Hostname>,
    pub failed: BTreeMap<Hostname, String>,
}

/// Deletes accelerator nodes strictly one after another.
pub struct AcceleratorPath {
    deleter: Arc<dyn AcceleratorDeleter>,
}

impl AcceleratorPath {
    pub fn new(deleter: Arc<dyn AcceleratorDeleter>) -> Self {
        Self { deleter }
    }

    /// Delete each `(hostname, zone)`; each call completes before the next.
    pub async fn delete_all(&self, nodes: &[(Hostname, String)]) -> AcceleratorReport {
        let mut report = AcceleratorReport::default();
        for (hostname, zone) in nodes {
            match self.deleter.delete(hostname, zone).await {
                Ok(()) => {
                    info!(node = %hostname, zone = %zone, "accelerator node deleted");
                    report.deleted.push(hostname.clone());
                }
                Err(e) => {
                    error!(node = %hostname, error = %e, "accelerator delete failed");
                    report.failed.insert(hostname.clone(), e.to_string());
                }
            }
        }
        report
    }
}
