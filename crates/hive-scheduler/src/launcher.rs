//! Worker process launcher.
//!
//! Workers run as separate OS processes: the current executable is
//! re-executed with the `worker` subcommand. The broker URL travels in the
//! environment so credentials stay out of the process table.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use hive_core::{DeviceToken, Pid, PoolKind};

use crate::error::{SchedulerError, SchedulerResult};

/// Environment variable carrying the broker URL to workers.
pub const BROKER_URL_ENV: &str = "HIVE_BROKER_URL";

/// What to start.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub kind: PoolKind,
    pub device: Option<DeviceToken>,
    pub drain_timeout: Duration,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running worker process owned by exactly one handle.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Pid;

    /// Non-blocking exit check.
    fn try_exit(&mut self) -> SchedulerResult<Option<WorkerExit>>;

    /// Ask the worker to drain (SIGTERM).
    fn terminate(&mut self) -> SchedulerResult<()>;

    /// Force-kill and reap.
    async fn kill(&mut self) -> SchedulerResult<WorkerExit>;

    /// Wait for exit.
    async fn wait(&mut self) -> SchedulerResult<WorkerExit>;
}

/// Starts worker processes.
pub trait WorkerLauncher: Send {
    fn launch(&mut self, spec: &WorkerSpec) -> SchedulerResult<Box<dyn WorkerProcess>>;
}

/// Launches `<exe> worker ...` children.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    broker_url: String,
    config_path: Option<PathBuf>,
    spec_path: Option<PathBuf>,
}

impl ProcessLauncher {
    /// Re-execute the current binary.
    pub fn current_exe(broker_url: impl Into<String>) -> SchedulerResult<Self> {
        let program = std::env::current_exe().map_err(SchedulerError::Spawn)?;
        Ok(Self::new(program, broker_url))
    }

    pub fn new(program: impl Into<PathBuf>, broker_url: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            broker_url: broker_url.into(),
            config_path: None,
            spec_path: None,
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_spec_path(mut self, path: Option<PathBuf>) -> Self {
        self.spec_path = path;
        self
    }

    /// Arguments after the program name.
    pub fn args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec![
            "worker".to_string(),
            "--kind".to_string(),
            spec.kind.label().to_string(),
            "--drain-timeout".to_string(),
            format!("{}ms", spec.drain_timeout.as_millis()),
        ];
        if let Some(device) = &spec.device {
            args.push("--device".to_string());
            args.push(device.to_string());
        }
        if let Some(path) = &self.spec_path {
            args.push("--spec-path".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&mut self, spec: &WorkerSpec) -> SchedulerResult<Box<dyn WorkerProcess>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(spec))
            .env(BROKER_URL_ENV, &self.broker_url)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(DeviceToken::Single { device, .. }) = &spec.device {
            debug!(%device, "pinning worker to host device");
        }
        let child = cmd.spawn().map_err(SchedulerError::Spawn)?;
        let process = OsProcess::new(child).map_err(SchedulerError::Spawn)?;
        info!(
            pid = process.pid(),
            pool = %spec.kind,
            device = spec.device.as_ref().map(|d| d.to_string()),
            "worker process spawned"
        );
        Ok(Box::new(process))
    }
}

/// A child process started by [`ProcessLauncher`].
pub struct OsProcess {
    pid: Pid,
    child: Child,
}

impl OsProcess {
    pub fn new(child: Child) -> std::io::Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("child exited before its pid was read"))?;
        Ok(Self { pid, child })
    }

    fn process_err(&self, source: std::io::Error) -> SchedulerError {
        SchedulerError::Process {
            pid: self.pid,
            source,
        }
    }
}

#[async_trait]
impl WorkerProcess for OsProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn try_exit(&mut self) -> SchedulerResult<Option<WorkerExit>> {
        self.child
            .try_wait()
            .map(|status| status.map(WorkerExit::from))
            .map_err(|e| self.process_err(e))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> SchedulerResult<()> {
        // SAFETY: plain syscall; the pid belongs to a child we have not reaped.
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            return Err(self.process_err(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> SchedulerResult<()> {
        self.child.start_kill().map_err(|e| self.process_err(e))
    }

    async fn kill(&mut self) -> SchedulerResult<WorkerExit> {
        if let Err(e) = self.child.start_kill() {
            // Already exited is fine; anything else is reported.
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(self.process_err(e));
            }
        }
        self.wait().await
    }

    async fn wait(&mut self) -> SchedulerResult<WorkerExit> {
        match self.child.wait().await {
            Ok(status) => Ok(status.into()),
            Err(e) => Err(self.process_err(e)),
        }
    }
}
