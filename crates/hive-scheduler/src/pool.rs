//! Worker pool — ordered worker handles for one pool kind.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use hive_core::{DeviceToken, Pid, PoolKind, ScalingThresholds};

use crate::error::SchedulerResult;
use crate::launcher::{WorkerExit, WorkerProcess};

/// One live worker. Owns its process; dropping the handle kills it.
pub struct WorkerHandle {
    pub pid: Pid,
    /// Set once at spawn, samplers only.
    pub device: Option<DeviceToken>,
    pub created_at: Instant,
    alive: bool,
    process: Box<dyn WorkerProcess>,
}

impl WorkerHandle {
    /// Track a freshly launched process, stamped with the current time.
    pub fn new(process: Box<dyn WorkerProcess>, device: Option<DeviceToken>) -> Self {
        Self {
            pid: process.pid(),
            device,
            created_at: Instant::now(),
            alive: true,
            process,
        }
    }

    /// False once an exit has been observed.
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Poll the process; marks the handle dead once it has exited.
    pub fn poll_exit(&mut self) -> SchedulerResult<Option<WorkerExit>> {
        let exit = self.process.try_exit()?;
        if exit.is_some() {
            self.alive = false;
        }
        Ok(exit)
    }

    /// SIGTERM, wait up to `join_timeout`, then force-kill.
    ///
    /// Consumes the handle: a terminated worker cannot be terminated again.
    pub async fn terminate(mut self, join_timeout: Duration) -> SchedulerResult<WorkerExit> {
        if let Some(exit) = self.poll_exit()? {
            return Ok(exit);
        }
        self.process.terminate()?;
        match tokio::time::timeout(join_timeout, self.process.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    pid = self.pid,
                    timeout_secs = join_timeout.as_secs(),
                    "termination timeout, forcing kill"
                );
                self.process.kill().await
            }
        }
    }

    /// Force-kill with no grace period.
    pub async fn kill(mut self) -> SchedulerResult<WorkerExit> {
        self.process.kill().await
    }

    /// Send SIGTERM without waiting.
    pub fn signal_terminate(&mut self) -> SchedulerResult<()> {
        self.process.terminate()
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> SchedulerResult<WorkerExit> {
        let exit = self.process.wait().await?;
        self.alive = false;
        Ok(exit)
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("device", &self.device)
            .field("alive", &self.alive)
            .finish()
    }
}

/// Workers of one kind, in registration order (oldest first).
#[derive(Debug)]
pub struct WorkerPool {
    kind: PoolKind,
    thresholds: ScalingThresholds,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// An empty pool bounded by `thresholds`.
    pub fn new(kind: PoolKind, thresholds: ScalingThresholds) -> Self {
        Self {
            kind,
            thresholds,
            handles: Vec::new(),
        }
    }

    /// Which kind of worker this pool holds.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Lower bound on pool size.
    pub fn min(&self) -> u32 {
        self.thresholds.min
    }

    /// Upper bound on pool size.
    pub fn max(&self) -> u32 {
        self.thresholds.max
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Tracked workers, as compared against `min` and `max`.
    pub fn size(&self) -> u32 {
        self.handles.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Pids, oldest first.
    pub fn pids(&self) -> Vec<Pid> {
        self.handles.iter().map(|h| h.pid).collect()
    }

    /// Register a newly started worker as the youngest.
    pub fn push(&mut self, handle: WorkerHandle) {
        self.handles.push(handle);
    }

    /// Remove the handle at `index` (0 is the oldest).
    pub fn remove(&mut self, index: usize) -> Option<WorkerHandle> {
        (index < self.handles.len()).then(|| self.handles.remove(index))
    }

    pub fn remove_oldest(&mut self) -> Option<WorkerHandle> {
        self.remove(0)
    }

    /// Remove every handle, oldest first.
    pub fn drain(&mut self) -> Vec<WorkerHandle> {
        std::mem::take(&mut self.handles)
    }

    /// Drop handles whose process has exited and return their exits.
    pub fn reap_exited(&mut self) -> Vec<(Pid, WorkerExit)> {
        let mut exited = Vec::new();
        self.handles.retain_mut(|handle| match handle.poll_exit() {
            Ok(Some(exit)) => {
                if exit.success() {
                    info!(pid = handle.pid, "worker exited");
                } else {
                    warn!(pid = handle.pid, code = exit.code, "worker exited abnormally");
                }
                exited.push((handle.pid, exit));
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = handle.pid, error = %e, "could not poll worker");
                true
            }
        });
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{WorkerLauncher, WorkerSpec};
    use crate::testing::{FakeLauncher, OnTerm};

    fn spawn(launcher: &mut FakeLauncher) -> WorkerHandle {
        let spec = WorkerSpec {
            kind: PoolKind::Evaluator,
            device: None,
            drain_timeout: Duration::from_secs(60),
        };
        WorkerHandle::new(launcher.launch(&spec).unwrap(), None)
    }

    #[tokio::test]
    async fn pool_keeps_registration_order() {
        let mut launcher = FakeLauncher::new();
        let mut pool = WorkerPool::new(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 4));
        for _ in 0..3 {
            pool.push(spawn(&mut launcher));
        }
        assert_eq!(pool.pids(), vec![1001, 1002, 1003]);
        assert_eq!(pool.remove_oldest().unwrap().pid, 1001);
        assert_eq!(pool.remove(5).map(|h| h.pid), None);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn reap_removes_crashed_workers_once() {
        let mut launcher = FakeLauncher::new();
        let mut pool = WorkerPool::new(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 4));
        pool.push(spawn(&mut launcher));
        pool.push(spawn(&mut launcher));

        launcher.crash(1001);
        let reaped = pool.reap_exited();
        assert_eq!(reaped, vec![(1001, WorkerExit { code: Some(1) })]);
        assert_eq!(pool.pids(), vec![1002]);
        assert!(pool.reap_exited().is_empty());
    }

    #[tokio::test]
    async fn graceful_terminate_of_cooperative_worker() {
        let mut launcher = FakeLauncher::new();
        let handle = spawn(&mut launcher);
        let exit = handle.terminate(Duration::from_secs(65)).await.unwrap();
        assert!(exit.success());
        assert_eq!(launcher.terminated(), vec![1001]);
        assert!(launcher.killed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_worker_is_killed_after_join_timeout() {
        let mut launcher = FakeLauncher::new();
        launcher.set_on_term(OnTerm::Ignore);
        let handle = spawn(&mut launcher);

        let started = Instant::now();
        let exit = handle.terminate(Duration::from_secs(15)).await.unwrap();
        assert_eq!(exit.code, None);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
        assert_eq!(launcher.killed(), vec![1001]);
    }
}
