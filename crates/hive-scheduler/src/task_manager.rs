//! Task manager — owns one worker pool and drives its control loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hive_broker::{BrokerConnector, BrokerSession};
use hive_core::{PoolKind, Settings};
use hive_probe::ResourceProbe;

use crate::error::SchedulerResult;
use crate::launcher::WorkerLauncher;
use crate::pool::WorkerPool;
use crate::resource_manager::{ResourceManager, TickOutcome};

/// Owns one pool's workers, its broker session and its probe, and runs the
/// periodic scaling loop over them.
pub struct TaskManager {
    pool: WorkerPool,
    manager: ResourceManager,
    connector: Arc<dyn BrokerConnector>,
    session: Option<Arc<dyn BrokerSession>>,
    probe: Box<dyn ResourceProbe>,
    launcher: Box<dyn WorkerLauncher>,
    interval: Duration,
    initial_delay: Duration,
}

impl TaskManager {
    /// An empty pool of `kind`; call [`TaskManager::launch`] to start workers.
    pub fn new(
        kind: PoolKind,
        settings: &Settings,
        connector: Arc<dyn BrokerConnector>,
        probe: Box<dyn ResourceProbe>,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        let manager = ResourceManager::new(settings, kind);
        Self {
            pool: WorkerPool::new(kind, *manager.policy().thresholds()),
            manager,
            connector,
            session: None,
            probe,
            launcher,
            interval: settings.interval,
            initial_delay: settings.initial_delay,
        }
    }

    /// Override the tick interval (the `--check-interval` flag).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Which pool this manager drives.
    pub fn kind(&self) -> PoolKind {
        self.pool.kind()
    }

    /// The workers currently tracked.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start `count` workers; returns how many actually started.
    pub async fn launch(&mut self, count: u32) -> usize {
        let snapshot = if self.kind().needs_device() {
            match self.probe.snapshot().await {
                Ok(snap) => Some(snap),
                Err(e) => {
                    warn!(error = %e, "resource snapshot failed, samplers get the default device");
                    None
                }
            }
        } else {
            None
        };
        let mut planner = self.manager.planner(snapshot.as_ref());

        let mut started = 0;
        for _ in 0..count {
            match self.manager.start_worker(
                &mut self.pool,
                self.launcher.as_mut(),
                planner.as_mut(),
            ) {
                Ok(_) => started += 1,
                Err(e) => warn!(pool = %self.kind(), error = %e, "could not start worker"),
            }
        }
        info!(pool = %self.kind(), requested = count, started, "initial workers launched");
        started
    }

    async fn session(&mut self) -> SchedulerResult<Arc<dyn BrokerSession>> {
        if let Some(session) = &self.session {
            if session.is_connected() {
                return Ok(session.clone());
            }
            warn!("broker session lost, reconnecting");
            self.drop_session().await;
        }
        let session = self.connector.connect().await?;
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Close and forget the current session so the next tick reconnects.
    async fn drop_session(&mut self) {
        if let Some(session) = self.session.take()
            && let Err(e) = session.close().await
        {
            warn!(error = %e, "closing broker session failed");
        }
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) -> SchedulerResult<TickOutcome> {
        for (pid, exit) in self.pool.reap_exited() {
            debug!(pid, code = exit.code, "reaped worker");
        }

        let session = self.session().await?;
        let queue = self.kind().input_queue();
        let depth = match session.queue_depth(queue).await {
            Ok(depth) => depth,
            Err(e) => {
                self.drop_session().await;
                return Err(e.into());
            }
        };

        let snapshot = match self.probe.snapshot().await {
            Ok(snap) => Some(snap),
            Err(e) => {
                warn!(error = %e, "resource snapshot failed");
                None
            }
        };

        debug!(pool = %self.kind(), queue, depth, size = self.pool.size(), "tick");
        self.manager
            .decide(
                depth,
                snapshot.as_ref(),
                &mut self.pool,
                self.probe.as_mut(),
                self.launcher.as_mut(),
            )
            .await
    }

    /// Tick every interval until `shutdown` fires. Tick errors are logged.
    pub async fn run_control_loop(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pool = %self.kind(),
            interval_secs = self.interval.as_secs(),
            initial_delay_secs = self.initial_delay.as_secs(),
            "control loop started"
        );

        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.initial_delay) => {}
                _ = shutdown.changed() => {
                    info!(pool = %self.kind(), "control loop shutting down");
                    return;
                }
            }
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.tick().await {
                        Ok(TickOutcome::NoChange) => {}
                        Ok(outcome) => info!(pool = %self.kind(), ?outcome, size = self.pool.size(), "tick"),
                        Err(e) => error!(pool = %self.kind(), error = %e, "tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(pool = %self.kind(), "control loop shutting down");
                    break;
                }
            }
        }
    }

    /// SIGTERM every worker, wait up to `timeout` overall, kill the rest.
    pub async fn shutdown_all(&mut self, timeout: Duration) {
        let mut handles = self.pool.drain();
        info!(pool = %self.kind(), workers = handles.len(), "stopping all workers");

        for handle in &mut handles {
            if let Err(e) = handle.signal_terminate() {
                warn!(pid = handle.pid, error = %e, "SIGTERM failed");
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut stragglers = Vec::new();
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, handle.wait()).await {
                Ok(Ok(exit)) => debug!(pid = handle.pid, code = exit.code, "worker stopped"),
                Ok(Err(e)) => warn!(pid = handle.pid, error = %e, "waiting for worker failed"),
                Err(_) => stragglers.push(handle),
            }
        }

        for handle in stragglers {
            let pid = handle.pid;
            warn!(pid, "worker did not stop in time, killing");
            if let Err(e) = handle.kill().await {
                warn!(pid, error = %e, "kill failed");
            }
        }

        self.drop_session().await;
        info!(pool = %self.kind(), "all workers stopped");
    }
}
