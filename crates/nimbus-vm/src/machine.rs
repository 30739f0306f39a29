//! Hypervisor type - a supervised system emulator process.

use crate::config::LaunchConfig;
use crate::error::{Result, VmError};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Liveness of a hypervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is running
    Running,
    /// Process has exited and been reaped; carries the exit code, if any
    Exited(Option<i32>),
}

impl ProcessState {
    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited(Some(code)) => write!(f, "exited with code {code}"),
            ProcessState::Exited(None) => write!(f, "killed by signal"),
        }
    }
}

/// A running (or exited) hypervisor process.
///
/// The child is owned by a supervisor task that waits on it, so it is always
/// reaped as soon as it exits. Liveness is published through a watch channel
/// and can be read without touching the OS.
pub struct Hypervisor {
    /// OS process id at spawn time
    pid: Option<u32>,
    /// Binary that was executed
    binary: PathBuf,
    /// Latest process state, published by the supervisor
    state: watch::Receiver<ProcessState>,
    /// Kill request for the supervisor, consumed on first terminate
    kill: Mutex<Option<oneshot::Sender<()>>>,
    /// Supervisor task handle
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Hypervisor {
    /// Spawn the system emulator described by `config`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the binary
    /// cannot be executed.
    pub async fn spawn(config: LaunchConfig) -> Result<Self> {
        config.validate()?;

        let args = config.args();
        tracing::info!(
            binary = %config.binary.display(),
            arch = %config.arch,
            vcpus = config.vcpus,
            ram_mb = config.ram_mb,
            accelerate = config.accelerate,
            "Launching hypervisor"
        );
        tracing::debug!(?args, "Hypervisor arguments");

        let child = Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::error!(binary = %config.binary.display(), error = %source, "Hypervisor spawn failed");
                VmError::Launch {
                    binary: config.binary.display().to_string(),
                    source,
                }
            })?;

        let pid = child.id();
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (kill_tx, kill_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, pid, kill_rx, state_tx));

        tracing::info!(?pid, "Hypervisor started");

        Ok(Self {
            pid,
            binary: config.binary,
            state: state_rx,
            kill: Mutex::new(Some(kill_tx)),
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// OS process id, if the process was assigned one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Binary that was executed.
    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Current process state. Never blocks.
    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Wait until the process has exited.
    pub async fn wait_exit(&self) -> ProcessState {
        let mut state = self.state.clone();
        state
            .wait_for(|s| !s.is_running())
            .await
            .map(|s| *s)
            // supervisor went away without publishing; the child was dropped
            // with kill_on_drop, so it is gone either way
            .unwrap_or(ProcessState::Exited(None))
    }

    /// Kill the process and wait for it to be reaped.
    ///
    /// Safe to call any number of times, and after the process exited on
    /// its own.
    pub async fn terminate(&self) -> ProcessState {
        if let Some(kill) = self.kill.lock().await.take() {
            if self.state().is_running() {
                tracing::debug!(pid = ?self.pid, "Killing hypervisor");
            }
            // the supervisor may already be gone if the process exited
            let _ = kill.send(());
        }

        let state = self.wait_exit().await;

        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::warn!(pid = ?self.pid, error = %e, "Hypervisor supervisor task failed");
            }
        }

        tracing::info!(pid = ?self.pid, %state, "Hypervisor terminated");
        state
    }
}

impl fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hypervisor")
            .field("pid", &self.pid)
            .field("binary", &self.binary)
            .field("state", &self.state())
            .finish()
    }
}

/// Own the child until it exits, killing it on request.
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    kill: oneshot::Receiver<()>,
    state: watch::Sender<ProcessState>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // a dropped sender means the Hypervisor handle is gone: kill as well
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(?pid, error = %e, "start_kill failed, process already exited");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ProcessState::Exited(status.code()),
        Err(e) => {
            tracing::warn!(?pid, error = %e, "Failed to wait on hypervisor");
            ProcessState::Exited(None)
        }
    };
    tracing::debug!(?pid, state = %exit, "Hypervisor exited");
    state.send_replace(exit);
}
