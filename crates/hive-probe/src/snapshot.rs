//! Immutable resource snapshot taken once per control-loop tick.

use serde::Serialize;

use hive_core::DeviceRef;

/// System load averages over 1, 5 and 15 minutes.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

impl LoadAverage {
    pub fn new(one: f64, five: f64, fifteen: f64) -> Self {
        Self { one, five, fifteen }
    }

    /// Whether the 1-minute load exceeds the cores we may run on.
    pub fn exceeds(&self, cores: usize) -> bool {
        self.one > cores as f64
    }
}

/// Memory and utilization of one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuMetrics {
    pub free_memory_mib: u64,
    pub total_memory_mib: u64,
    pub utilization_percent: u32,
}

/// One entry of the visible-device list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSnapshot {
    pub device: DeviceRef,
    /// Position in the visible list, i.e. the index the worker runtime sees.
    pub index: u32,
    /// `None` when the device could not be queried this tick.
    pub metrics: Option<GpuMetrics>,
}

/// Everything the scaling decision reads about the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub load: LoadAverage,
    /// Cores in this process's affinity mask.
    pub available_cores: usize,
    /// Utilization (percent) of each available core.
    pub core_usage: Vec<f32>,
    /// False when NVML could not be initialized.
    pub gpu_monitoring: bool,
    pub gpus: Vec<GpuSnapshot>,
}

impl ResourceSnapshot {
    /// Number of available cores strictly below `ceiling` percent.
    pub fn cores_below(&self, ceiling: f32) -> usize {
        self.core_usage.iter().filter(|&&u| u < ceiling).count()
    }

    /// Mean utilization across available cores.
    pub fn average_core_usage(&self) -> f32 {
        if self.core_usage.is_empty() {
            return 0.0;
        }
        self.core_usage.iter().sum::<f32>() / self.core_usage.len() as f32
    }

    /// 1-minute load divided by available cores.
    pub fn load_ratio(&self) -> f64 {
        if self.available_cores == 0 {
            return 0.0;
        }
        self.load.one / self.available_cores as f64
    }

    pub fn is_overloaded(&self) -> bool {
        self.load.exceeds(self.available_cores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(core_usage: Vec<f32>, load_one: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            load: LoadAverage::new(load_one, load_one, load_one),
            available_cores: core_usage.len(),
            core_usage,
            gpu_monitoring: false,
            gpus: Vec::new(),
        }
    }

    #[test]
    fn cores_below_is_strict() {
        let snap = snapshot(vec![10.0, 50.0, 49.9, 80.0], 1.0);
        assert_eq!(snap.cores_below(50.0), 2);
    }

    #[test]
    fn average_core_usage_handles_empty() {
        assert_eq!(snapshot(Vec::new(), 0.0).average_core_usage(), 0.0);
        assert_eq!(snapshot(vec![20.0, 40.0], 0.0).average_core_usage(), 30.0);
    }

    #[test]
    fn overload_compares_one_minute_load_to_cores() {
        assert!(snapshot(vec![0.0; 8], 12.0).is_overloaded());
        assert!(!snapshot(vec![0.0; 8], 8.0).is_overloaded());
        assert_eq!(snapshot(vec![0.0; 8], 12.0).load_ratio(), 1.5);
    }

    #[test]
    fn snapshot_serializes_device_refs() {
        let mut snap = snapshot(vec![5.0], 0.5);
        snap.gpu_monitoring = true;
        snap.gpus.push(GpuSnapshot {
            device: DeviceRef::Uuid("GPU-1".to_string()),
            index: 0,
            metrics: None,
        });
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains(r#""device":{"type":"uuid","value":"GPU-1"}"#));
    }
}
