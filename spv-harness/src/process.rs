//! External process lifecycle: spawning node and wallet binaries with
//! isolated directories, health checks, and graceful stop escalating to a
//! forced kill.

use std::fs::File;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{HarnessError, Result};

/// Everything needed to launch one external process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Name used in logs and errors (e.g. `node1`, `wallet1`)
    pub name: String,
    /// Executable, resolved through `PATH` when relative
    pub program: PathBuf,
    /// Command line arguments
    pub args: Vec<String>,
    /// Directory owned exclusively by this process
    pub data_dir: PathBuf,
    /// File receiving both stdout and stderr
    pub log_file: PathBuf,
}

/// How a stop request ended when it ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone before the stop request.
    AlreadyExited(ExitStatus),
    /// The process exited successfully after the interrupt.
    Exited(ExitStatus),
}

/// Capability to manage an external OS process.
#[async_trait]
pub trait ExternalProcessHandle: Send {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Health check: true while the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Interrupt the process, wait up to `grace` for it to exit and kill it
    /// otherwise. Abnormal exits and forced kills are `Shutdown` errors.
    async fn stop(&mut self, grace: Duration) -> Result<StopOutcome>;
}

/// A child process spawned by the harness.
pub struct OsProcess {
    name: String,
    child: Child,
}

impl OsProcess {
    /// Spawn `spec.program`, redirecting its output to `spec.log_file`.
    ///
    /// The child is killed if the handle is dropped without being stopped.
    pub fn start(spec: &ProcessSpec) -> Result<Self> {
        info!(
            "Spawning {} ({}) in {}",
            spec.name,
            spec.program.display(),
            spec.data_dir.display()
        );

        let log = File::create(&spec.log_file).map_err(|e| {
            HarnessError::setup_io(
                &format!("unable to create {} log file", spec.name),
                &spec.data_dir,
                e,
            )
        })?;
        let log_err = log.try_clone().map_err(|e| {
            HarnessError::setup_io(
                &format!("unable to share {} log file", spec.name),
                &spec.data_dir,
                e,
            )
        })?;

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::setup(
                    format!("unable to start {} ({}): {e}", spec.name, spec.program.display()),
                    &spec.data_dir,
                )
            })?;

        info!("{} spawned with pid {:?}", spec.name, child.id());
        Ok(Self { name: spec.name.clone(), child })
    }
}

#[async_trait]
impl ExternalProcessHandle for OsProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn stop(&mut self, grace: Duration) -> Result<StopOutcome> {
        let exited = self
            .child
            .try_wait()
            .map_err(|e| HarnessError::shutdown(&self.name, format!("status check failed: {e}")))?;
        if let Some(status) = exited {
            info!("{} already exited with {}", self.name, status);
            return Ok(StopOutcome::AlreadyExited(status));
        }

        info!("Stopping {}", self.name);
        if let Err(e) = interrupt(&mut self.child) {
            error!("Error sending interrupt to {}: {}", self.name, e);
            let killed = self.child.kill().await;
            return Err(HarnessError::shutdown(
                &self.name,
                format!("interrupt failed ({e}); forced kill: {}", describe_kill(&killed)),
            ));
        }

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                info!("{} exited with status: {}", self.name, status);
                Ok(StopOutcome::Exited(status))
            }
            Ok(Ok(status)) => Err(HarnessError::shutdown(
                &self.name,
                format!("exited with {status}"),
            )),
            Ok(Err(e)) => Err(HarnessError::shutdown(&self.name, format!("wait failed: {e}"))),
            Err(_) => {
                warn!(
                    "{} did not exit within {:?} after interrupt, forcing kill",
                    self.name, grace
                );
                let killed = self.child.kill().await;
                Err(HarnessError::shutdown(
                    &self.name,
                    format!("timed out after interrupt; forced kill: {}", describe_kill(&killed)),
                ))
            }
        }
    }
}

fn describe_kill(result: &std::io::Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("failed: {e}"),
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = child.id().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "process already reaped")
    })?;
    let pid = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(std::io::Error::from)
}

// No portable interrupt outside unix; fall back to terminating outright.
#[cfg(not(unix))]
fn interrupt(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Collects teardown failures without short-circuiting later steps.
#[derive(Debug, Default)]
pub struct TeardownReport {
    errors: Vec<HarnessError>,
}

impl TeardownReport {
    /// An empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one teardown step.
    pub fn record<T>(&mut self, step: &str, result: Result<T>) {
        if let Err(e) = result {
            error!("Teardown step '{}' failed: {}", step, e);
            self.errors.push(e);
        }
    }

    /// Append the failures of `other`.
    pub fn merge(&mut self, other: TeardownReport) {
        self.errors.extend(other.errors);
    }

    /// True when no step failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Failures in the order they were recorded.
    pub fn errors(&self) -> &[HarnessError] {
        &self.errors
    }

    /// `Ok` when clean, otherwise one [`HarnessError::Teardown`].
    pub fn into_result(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Teardown(self.errors))
        }
    }
}

/// Remove any leftovers from a previous run and recreate `dir` empty.
pub fn prepare_data_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(HarnessError::setup_io("unable to clear data dir", dir, e)),
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| HarnessError::setup_io("unable to create data dir", dir, e))
}

/// Reserve an ephemeral loopback port by binding and immediately releasing it.
///
/// Callers attach the data directory of the process the port is for.
pub fn allocate_local_addr() -> std::io::Result<SocketAddr> {
    TcpListener::bind("127.0.0.1:0")?.local_addr()
}
