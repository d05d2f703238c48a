//! Resource probe trait and its sysinfo/NVML implementation.

use std::time::Duration;

use async_trait::async_trait;
use sysinfo::System;
use tracing::debug;

use hive_core::{DeviceRef, Pid};

use crate::error::{ProbeError, ProbeResult};
use crate::gpu::GpuMonitor;
use crate::snapshot::{LoadAverage, ResourceSnapshot};

/// Window over which per-process CPU usage is measured.
pub const PROCESS_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Read-only view of host and GPU resources.
///
/// The scheduler holds one probe per pool. Every method reads fresh
/// values; nothing is cached across ticks.
#[async_trait]
pub trait ResourceProbe: Send {
    /// Take a full snapshot for one control-loop tick.
    async fn snapshot(&mut self) -> ProbeResult<ResourceSnapshot>;

    /// Current load averages.
    fn load_average(&mut self) -> LoadAverage;

    /// Number of cores this process may run on.
    fn available_cores(&self) -> usize;

    /// CPU usage (percent of one core) of each pid, in input order.
    /// `None` for processes that could not be read.
    async fn process_cpu(&mut self, pids: &[Pid]) -> Vec<Option<f32>>;

    /// Utilization (percent) of one visible GPU.
    fn device_utilization(&self, device: &DeviceRef) -> ProbeResult<u32>;

    /// Whether GPU monitoring initialized.
    fn gpu_available(&self) -> bool;

    /// Resident set size of a process, in bytes.
    fn resident_memory(&mut self, pid: Pid) -> Option<u64>;
}

/// Probe backed by `sysinfo`, `sched_getaffinity` and NVML.
pub struct SystemProbe {
    system: System,
    gpu: GpuMonitor,
    cores: Vec<usize>,
    process_window: Duration,
}

impl SystemProbe {
    /// Build a probe, initializing NVML once.
    pub fn new() -> ProbeResult<Self> {
        Self::with_gpu(GpuMonitor::init())
    }

    pub fn with_gpu(gpu: GpuMonitor) -> ProbeResult<Self> {
        let mut system = System::new();
        system.refresh_cpu();
        let cores = match affinity_cores() {
            Some(cores) => cores,
            None => (0..system.cpus().len()).collect(),
        };
        if cores.is_empty() {
            return Err(ProbeError::NoCores);
        }
        debug!(cores = cores.len(), gpu = gpu.is_available(), "resource probe ready");
        Ok(Self {
            system,
            gpu,
            cores,
            process_window: PROCESS_SAMPLE_WINDOW,
        })
    }

    pub fn with_process_window(mut self, window: Duration) -> Self {
        self.process_window = window;
        self
    }

    pub fn gpu(&self) -> &GpuMonitor {
        &self.gpu
    }

    async fn refresh_core_usage(&mut self) -> Vec<f32> {
        self.system.refresh_cpu();
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        self.system.refresh_cpu();
        let cpus = self.system.cpus();
        self.cores
            .iter()
            .filter_map(|&id| cpus.get(id).map(|cpu| cpu.cpu_usage()))
            .collect()
    }
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn snapshot(&mut self) -> ProbeResult<ResourceSnapshot> {
        let core_usage = self.refresh_core_usage().await;
        Ok(ResourceSnapshot {
            load: self.load_average(),
            available_cores: self.cores.len(),
            core_usage,
            gpu_monitoring: self.gpu.is_available(),
            gpus: self.gpu.sample(),
        })
    }

    fn load_average(&mut self) -> LoadAverage {
        let load = System::load_average();
        LoadAverage::new(load.one, load.five, load.fifteen)
    }

    fn available_cores(&self) -> usize {
        self.cores.len()
    }

    async fn process_cpu(&mut self, pids: &[Pid]) -> Vec<Option<f32>> {
        for &pid in pids {
            self.system.refresh_process(sysinfo::Pid::from_u32(pid));
        }
        tokio::time::sleep(self.process_window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL)).await;
        pids.iter()
            .map(|&pid| {
                let spid = sysinfo::Pid::from_u32(pid);
                if !self.system.refresh_process(spid) {
                    debug!(pid, "process vanished while sampling CPU");
                    return None;
                }
                self.system.process(spid).map(|p| p.cpu_usage())
            })
            .collect()
    }

    fn device_utilization(&self, device: &DeviceRef) -> ProbeResult<u32> {
        self.gpu.utilization(device)
    }

    fn gpu_available(&self) -> bool {
        self.gpu.is_available()
    }

    fn resident_memory(&mut self, pid: Pid) -> Option<u64> {
        let spid = sysinfo::Pid::from_u32(pid);
        if !self.system.refresh_process(spid) {
            return None;
        }
        self.system.process(spid).map(|p| p.memory())
    }
}

/// Cores in this process's affinity mask.
#[cfg(target_os = "linux")]
fn affinity_cores() -> Option<Vec<usize>> {
    // SAFETY: cpu_set_t is plain data; sched_getaffinity writes at most
    // size_of::<cpu_set_t>() bytes into it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return None;
        }
        let cores = (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect();
        Some(cores)
    }
}

#[cfg(not(target_os = "linux"))]
fn affinity_cores() -> Option<Vec<usize>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sees_at_least_one_core() {
        let probe = SystemProbe::with_gpu(GpuMonitor::unavailable(Vec::new())).unwrap();
        assert!(probe.available_cores() >= 1);
        assert!(!probe.gpu_available());
    }

    #[tokio::test]
    async fn snapshot_covers_available_cores() {
        let mut probe = SystemProbe::with_gpu(GpuMonitor::unavailable(Vec::new())).unwrap();
        let snap = probe.snapshot().await.unwrap();
        assert_eq!(snap.available_cores, probe.available_cores());
        assert!(snap.core_usage.len() <= snap.available_cores);
        assert!(!snap.gpu_monitoring);
        assert!(snap.gpus.is_empty());
    }

    #[tokio::test]
    async fn process_cpu_reads_own_pid_and_skips_missing() {
        let mut probe = SystemProbe::with_gpu(GpuMonitor::unavailable(Vec::new()))
            .unwrap()
            .with_process_window(Duration::from_millis(10));
        let own = std::process::id();
        let samples = probe.process_cpu(&[own, u32::MAX - 1]).await;
        assert_eq!(samples.len(), 2);
        assert!(samples[0].is_some());
        assert!(samples[1].is_none());
    }

    #[test]
    fn resident_memory_of_own_process() {
        let mut probe = SystemProbe::with_gpu(GpuMonitor::unavailable(Vec::new())).unwrap();
        assert!(probe.resident_memory(std::process::id()).unwrap_or(0) > 0);
    }
}
