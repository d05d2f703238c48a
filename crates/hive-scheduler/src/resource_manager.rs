//! Resource manager — executes scaling decisions against a worker pool.
//!
//! Holds configuration only. The placement ledger lives for a single
//! decision batch and is dropped with it.

use tracing::{debug, info, warn};

use hive_autoscale::{
    CPU_FALLBACK_IDLE_THRESHOLD, DevicePlanner, ScaleDecision, ScalingPolicy, needs_shedding,
    pick_least_busy,
};
use hive_core::{DeviceToken, Pid, PlacementSettings, PoolKind, PoolSettings, Settings};
use hive_probe::{ResourceProbe, ResourceSnapshot};

use crate::error::{SchedulerError, SchedulerResult};
use crate::launcher::{WorkerLauncher, WorkerSpec};
use crate::pool::{WorkerHandle, WorkerPool};

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// A worker was started, with its device for samplers.
    Started {
        pid: Pid,
        device: Option<DeviceToken>,
    },
    /// An idle worker was asked to stop.
    Stopped {
        pid: Pid,
    },
    /// Load shedding terminated these workers, in order.
    Shed {
        terminated: Vec<Pid>,
    },
    /// A decision was made but could not be carried out this tick.
    Skipped(String),
    /// The pool already matches demand.
    NoChange,
}

/// Carries out the scaling policy for one pool: starts, stops and sheds workers.
pub struct ResourceManager {
    policy: ScalingPolicy,
    pool: PoolSettings,
    placement: PlacementSettings,
}

impl ResourceManager {
    /// Build the manager for the `kind` pool from resolved settings.
    pub fn new(settings: &Settings, kind: PoolKind) -> Self {
        let pool = settings.pool(kind).clone();
        Self {
            policy: ScalingPolicy::new(&pool, settings.cpu_gate, settings.shedding),
            pool,
            placement: settings.placement,
        }
    }

    /// The decision rules this manager executes.
    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Fresh placement ledger for one decision batch.
    pub fn planner(&self, snapshot: Option<&ResourceSnapshot>) -> Option<DevicePlanner> {
        match (self.pool.kind.needs_device(), snapshot) {
            (true, Some(snap)) => Some(DevicePlanner::new(snap, self.placement)),
            _ => None,
        }
    }

    fn worker_spec(&self, device: Option<DeviceToken>) -> WorkerSpec {
        WorkerSpec {
            kind: self.pool.kind,
            device,
            drain_timeout: self.pool.drain_timeout,
        }
    }

    /// Start one worker and register its handle.
    ///
    /// Samplers take a device from `planner`, or the runtime default when
    /// no snapshot was available to plan against.
    pub fn start_worker(
        &self,
        pool: &mut WorkerPool,
        launcher: &mut dyn WorkerLauncher,
        planner: Option<&mut DevicePlanner>,
    ) -> SchedulerResult<Pid> {
        let device = match (self.pool.kind.needs_device(), planner) {
            (false, _) => None,
            (true, Some(planner)) => Some(planner.place()?),
            (true, None) => Some(DeviceToken::Default),
        };
        let process = launcher.launch(&self.worker_spec(device.clone()))?;
        let handle = WorkerHandle::new(process, device);
        let pid = handle.pid;
        info!(
            pool = %self.pool.kind,
            pid,
            device = handle.device.as_ref().map(|d| d.to_string()),
            size = pool.size() + 1,
            "worker started"
        );
        pool.push(handle);
        Ok(pid)
    }

    /// Decide and act for one tick.
    ///
    /// `snapshot` is `None` when the probe failed; scale-up is then
    /// skipped and shedding is not evaluated.
    pub async fn decide(
        &self,
        depth: u32,
        snapshot: Option<&ResourceSnapshot>,
        pool: &mut WorkerPool,
        probe: &mut dyn ResourceProbe,
        launcher: &mut dyn WorkerLauncher,
    ) -> SchedulerResult<TickOutcome> {
        let size = pool.size();
        let decision = match snapshot {
            Some(snap) => self.policy.decide(depth, size, snap),
            None => match self.policy.queue_decision(depth, size) {
                ScaleDecision::ScaleUp => {
                    return Ok(TickOutcome::Skipped(
                        "resource snapshot unavailable".to_string(),
                    ));
                }
                other => other,
            },
        };
        debug!(pool = %self.pool.kind, depth, size, ?decision, "scaling decision");

        match decision {
            ScaleDecision::ScaleUp | ScaleDecision::Replace => {
                if decision == ScaleDecision::Replace {
                    warn!(pool = %self.pool.kind, size, min = pool.min(), "pool below minimum, replacing");
                }
                let mut planner = self.planner(snapshot);
                match self.start_worker(pool, launcher, planner.as_mut()) {
                    Ok(pid) => Ok(TickOutcome::Started {
                        pid,
                        device: pool.handles().last().and_then(|h| h.device.clone()),
                    }),
                    Err(SchedulerError::Placement(e)) => {
                        warn!(pool = %self.pool.kind, error = %e, "no GPU capacity, retrying next tick");
                        Ok(TickOutcome::Skipped(e.to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            ScaleDecision::ScaleDown => match self.scale_down(pool, probe).await? {
                Some(pid) => Ok(TickOutcome::Stopped { pid }),
                None => Ok(TickOutcome::NoChange),
            },
            ScaleDecision::Shed => Ok(TickOutcome::Shed {
                terminated: self.shed(pool, probe).await,
            }),
            ScaleDecision::NoChange => Ok(TickOutcome::NoChange),
        }
    }

    /// Gracefully stop the least busy worker, if one is idle enough.
    pub async fn scale_down(
        &self,
        pool: &mut WorkerPool,
        probe: &mut dyn ResourceProbe,
    ) -> SchedulerResult<Option<Pid>> {
        let Some(index) = self.select_victim(pool, probe).await else {
            info!(pool = %self.pool.kind, "no idle worker to stop");
            return Ok(None);
        };
        let Some(handle) = pool.remove(index) else {
            return Ok(None);
        };
        let pid = handle.pid;
        info!(pool = %self.pool.kind, pid, size = pool.size(), "stopping idle worker");
        match handle.terminate(self.pool.join_timeout).await {
            Ok(exit) => debug!(pid, code = exit.code, "worker stopped"),
            Err(e) => warn!(pid, error = %e, "worker termination failed"),
        }
        Ok(Some(pid))
    }

    /// Force-stop the oldest worker, wait out the backoff, recheck load;
    /// repeat until load fits the cores or the pool is at min.
    pub async fn shed(&self, pool: &mut WorkerPool, probe: &mut dyn ResourceProbe) -> Vec<Pid> {
        let backoff = self.policy.shedding().backoff;
        let mut terminated = Vec::new();
        loop {
            let load = probe.load_average();
            let cores = probe.available_cores();
            if !needs_shedding(&load, cores, pool.size(), pool.min()) {
                break;
            }
            let Some(handle) = pool.remove_oldest() else {
                break;
            };
            let pid = handle.pid;
            warn!(
                pool = %self.pool.kind,
                pid,
                load_1m = load.one,
                cores,
                "host overloaded, killing oldest worker"
            );
            if let Err(e) = handle.kill().await {
                warn!(pid, error = %e, "kill failed");
            }
            terminated.push(pid);
            if pool.size() <= pool.min() {
                break;
            }
            tokio::time::sleep(backoff).await;
        }
        if !terminated.is_empty() {
            info!(pool = %self.pool.kind, count = terminated.len(), size = pool.size(), "load shedding done");
        }
        terminated
    }

    async fn select_victim(
        &self,
        pool: &mut WorkerPool,
        probe: &mut dyn ResourceProbe,
    ) -> Option<usize> {
        match self.pool.kind {
            PoolKind::Evaluator => cpu_victim(pool, probe, self.pool.idle_threshold).await,
            PoolKind::Sampler => {
                let samples = gpu_samples(pool, probe);
                match samples {
                    Some(samples) => pick_least_busy(&samples, self.pool.idle_threshold),
                    None => {
                        debug!("falling back to CPU-based victim selection");
                        cpu_victim(pool, probe, CPU_FALLBACK_IDLE_THRESHOLD).await
                    }
                }
            }
        }
    }
}

async fn cpu_victim(
    pool: &mut WorkerPool,
    probe: &mut dyn ResourceProbe,
    threshold: f32,
) -> Option<usize> {
    let pids = pool.pids();
    let samples = probe.process_cpu(&pids).await;
    for (pid, sample) in pids.iter().zip(&samples) {
        debug!(pid, cpu = ?sample, "worker CPU usage");
    }
    pick_least_busy(&samples, threshold)
}

/// GPU utilization per worker, or `None` when the CPU path must be used.
fn gpu_samples(pool: &WorkerPool, probe: &dyn ResourceProbe) -> Option<Vec<Option<f32>>> {
    if !probe.gpu_available() {
        return None;
    }
    let mut any_single = false;
    let mut samples = Vec::with_capacity(pool.len());
    for handle in pool.handles() {
        match &handle.device {
            Some(DeviceToken::Single { device, .. }) => {
                any_single = true;
                match probe.device_utilization(device) {
                    Ok(util) => samples.push(Some(util as f32)),
                    Err(e) => {
                        warn!(pid = handle.pid, %device, error = %e, "GPU utilization read failed");
                        return None;
                    }
                }
            }
            _ => samples.push(None),
        }
    }
    any_single.then_some(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, OnTerm, ScriptedProbe};
    use hive_core::{DeviceRef, HiveConfig, ScalingThresholds};
    use hive_probe::{GpuMetrics, GpuSnapshot, LoadAverage};
    use std::time::Duration;

    fn settings() -> Settings {
        HiveConfig::default().settings().unwrap()
    }

    fn manager(kind: PoolKind, thresholds: ScalingThresholds) -> (ResourceManager, WorkerPool) {
        let mut settings = settings();
        match kind {
            PoolKind::Evaluator => settings.evaluator.thresholds = thresholds,
            PoolKind::Sampler => settings.sampler.thresholds = thresholds,
        }
        (
            ResourceManager::new(&settings, kind),
            WorkerPool::new(kind, thresholds),
        )
    }

    fn fill(rm: &ResourceManager, pool: &mut WorkerPool, launcher: &mut FakeLauncher, n: usize) {
        for _ in 0..n {
            rm.start_worker(pool, launcher, None).unwrap();
        }
    }

    fn gpu(index: u32, free: u64) -> GpuSnapshot {
        GpuSnapshot {
            device: DeviceRef::Index(index),
            index,
            metrics: Some(GpuMetrics {
                free_memory_mib: free,
                total_memory_mib: 81_920,
                utilization_percent: 0,
            }),
        }
    }

    #[tokio::test]
    async fn evaluator_scale_up_when_cores_idle() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 1);

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(20, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert!(matches!(out, TickOutcome::Started { device: None, .. }));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn probe_failure_skips_scale_up() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 1);

        let out = rm
            .decide(20, None, &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert!(matches!(out, TickOutcome::Skipped(_)));
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn evaluator_scale_down_picks_idle_worker() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 3);
        probe.update(|s| {
            s.process_cpu.insert(1001, 70.0);
            s.process_cpu.insert(1002, 10.0);
            s.process_cpu.insert(1003, 45.0);
        });

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(0, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert_eq!(out, TickOutcome::Stopped { pid: 1002 });
        assert_eq!(pool.pids(), vec![1001, 1003]);
        assert_eq!(launcher.terminated(), vec![1002]);
    }

    #[tokio::test]
    async fn busy_workers_are_not_stopped() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 3);
        probe.update(|s| {
            s.process_cpu.insert(1001, 70.0);
            s.process_cpu.insert(1002, 60.0);
            s.process_cpu.insert(1003, 45.0);
        });

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(0, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert_eq!(out, TickOutcome::NoChange);
        assert_eq!(pool.size(), 3);
        assert!(launcher.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shedding_stops_at_min() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 5);
        probe.update(|s| s.snapshot.load = LoadAverage::new(12.0, 12.0, 12.0));

        let started = tokio::time::Instant::now();
        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(100, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();

        assert_eq!(
            out,
            TickOutcome::Shed {
                terminated: vec![1001, 1002, 1003, 1004]
            }
        );
        assert_eq!(pool.pids(), vec![1005]);
        assert_eq!(launcher.killed(), vec![1001, 1002, 1003, 1004]);
        assert!(launcher.terminated().is_empty());
        // One backoff between consecutive terminations, none after the last.
        assert!(started.elapsed() >= Duration::from_secs(3 * 90));
        assert!(started.elapsed() < Duration::from_secs(4 * 90));
    }

    #[tokio::test(start_paused = true)]
    async fn no_backoff_once_pool_reaches_min() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 2);
        probe.update(|s| s.snapshot.load = LoadAverage::new(12.0, 12.0, 12.0));

        let started = tokio::time::Instant::now();
        let terminated = rm.shed(&mut pool, &mut probe).await;
        assert_eq!(terminated, vec![1001]);
        assert_eq!(pool.size(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn shedding_stops_when_load_recovers() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 5);
        probe.update(|s| {
            s.snapshot.load = LoadAverage::new(12.0, 12.0, 12.0);
            s.loads = [12.0, 10.0, 7.5]
                .into_iter()
                .map(|l| LoadAverage::new(l, l, l))
                .collect();
        });

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(100, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert_eq!(
            out,
            TickOutcome::Shed {
                terminated: vec![1001, 1002]
            }
        );
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn sampler_placement_refusal_is_skipped() {
        let (rm, mut pool) = manager(PoolKind::Sampler, ScalingThresholds::new(15, 0, 16));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        probe.update(|s| {
            s.snapshot.gpu_monitoring = true;
            s.snapshot.gpus = vec![gpu(0, 1_000)];
        });

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(100, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert!(matches!(out, TickOutcome::Skipped(_)));
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn sampler_gets_single_device_token() {
        let (rm, mut pool) = manager(PoolKind::Sampler, ScalingThresholds::new(15, 0, 16));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        probe.update(|s| {
            s.snapshot.gpu_monitoring = true;
            s.snapshot.gpus = vec![gpu(0, 1_000), gpu(1, 50_000)];
        });

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(100, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        let expected = DeviceToken::Single {
            device: DeviceRef::Index(1),
            index: 1,
        };
        assert_eq!(
            out,
            TickOutcome::Started {
                pid: 1001,
                device: Some(expected.clone())
            }
        );
        assert_eq!(launcher.launched()[0].device, Some(expected));
    }

    #[tokio::test]
    async fn sampler_victim_by_gpu_utilization() {
        let (rm, mut pool) = manager(PoolKind::Sampler, ScalingThresholds::new(15, 1, 16));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        probe.update(|s| {
            s.snapshot.gpu_monitoring = true;
            s.snapshot.gpus = vec![gpu(0, 80_000), gpu(1, 80_000)];
            s.gpu_utilization.insert(DeviceRef::Index(0), 80);
            s.gpu_utilization.insert(DeviceRef::Index(1), 3);
        });
        let snap = probe.snapshot().await.unwrap();
        let mut planner = rm.planner(Some(&snap)).unwrap();
        rm.start_worker(&mut pool, &mut launcher, Some(&mut planner)).unwrap();
        rm.start_worker(&mut pool, &mut launcher, Some(&mut planner)).unwrap();
        // 80000 - 32768 still clears the mark, so both land on device 0.
        let on_zero = pool
            .handles()
            .iter()
            .all(|h| h.device.as_ref().and_then(|d| d.device()) == Some(&DeviceRef::Index(0)));
        assert!(on_zero);

        let out = rm.scale_down(&mut pool, &mut probe).await.unwrap();
        // Both run on device 0 at 80%: nobody is idle.
        assert_eq!(out, None);

        probe.update(|s| {
            s.gpu_utilization.insert(DeviceRef::Index(0), 5);
        });
        let out = rm.scale_down(&mut pool, &mut probe).await.unwrap();
        assert_eq!(out, Some(1001));
    }

    #[tokio::test]
    async fn sampler_victim_falls_back_to_cpu_without_gpu() {
        let (rm, mut pool) = manager(PoolKind::Sampler, ScalingThresholds::new(15, 1, 16));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 2);
        probe.update(|s| {
            s.process_cpu.insert(1001, 50.0);
            s.process_cpu.insert(1002, 15.0);
        });

        assert_eq!(pool.handles()[0].device, Some(DeviceToken::Default));
        let out = rm.scale_down(&mut pool, &mut probe).await.unwrap();
        assert_eq!(out, Some(1002));
    }

    #[tokio::test]
    async fn replacement_ignores_busy_cores() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 2, 10));
        let mut launcher = FakeLauncher::new();
        let mut probe = ScriptedProbe::idle(8);
        probe.update(|s| s.snapshot.core_usage = vec![99.0; 8]);
        fill(&rm, &mut pool, &mut launcher, 1);

        let snap = probe.snapshot().await.unwrap();
        let out = rm
            .decide(0, Some(&snap), &mut pool, &mut probe, &mut launcher)
            .await
            .unwrap();
        assert!(matches!(out, TickOutcome::Started { .. }));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_victim_is_killed_after_join_timeout() {
        let (rm, mut pool) = manager(PoolKind::Evaluator, ScalingThresholds::new(5, 1, 10));
        let mut launcher = FakeLauncher::new();
        launcher.set_on_term(OnTerm::Ignore);
        let mut probe = ScriptedProbe::idle(8);
        fill(&rm, &mut pool, &mut launcher, 2);
        probe.update(|s| {
            s.process_cpu.insert(1001, 1.0);
            s.process_cpu.insert(1002, 90.0);
        });

        let out = rm.scale_down(&mut pool, &mut probe).await.unwrap();
        assert_eq!(out, Some(1001));
        assert_eq!(launcher.terminated(), vec![1001]);
        assert_eq!(launcher.killed(), vec![1001]);
    }
}
