//! NVML-backed GPU monitor.
//!
//! NVML is initialized once per process. If initialization fails the
//! monitor stays usable but reports every device as unqueryable, so
//! placement degrades to the runtime's default device.

use nvml_wrapper::Nvml;
use tracing::{debug, info, warn};

use hive_core::DeviceRef;

use crate::error::{ProbeError, ProbeResult};
use crate::snapshot::{GpuMetrics, GpuSnapshot};

/// Environment variable naming the host devices this process may use.
pub const VISIBLE_DEVICES_ENV: &str = "CUDA_VISIBLE_DEVICES";

const MIB: u64 = 1024 * 1024;

/// NVML access for the visible devices. Without NVML every query reports
/// nothing.
pub struct GpuMonitor {
    nvml: Option<Nvml>,
    visible: Vec<DeviceRef>,
}

impl GpuMonitor {
    /// Initialize NVML and resolve the visible device list.
    ///
    /// Never fails; a missing driver yields a monitor with
    /// [`is_available`](Self::is_available) returning false.
    pub fn init() -> Self {
        let visible_env = std::env::var(VISIBLE_DEVICES_ENV).ok();
        match Nvml::init() {
            Ok(nvml) => {
                let visible = match visible_env.as_deref() {
                    Some(list) => DeviceRef::parse_list(list),
                    None => match nvml.device_count() {
                        Ok(count) => (0..count).map(DeviceRef::Index).collect(),
                        Err(e) => {
                            warn!(error = %e, "failed to count GPUs");
                            Vec::new()
                        }
                    },
                };
                info!(devices = visible.len(), "GPU monitoring initialized");
                Self {
                    nvml: Some(nvml),
                    visible,
                }
            }
            Err(e) => {
                warn!(error = %e, "GPU monitoring unavailable");
                let visible = visible_env
                    .as_deref()
                    .map(DeviceRef::parse_list)
                    .unwrap_or_default();
                Self {
                    nvml: None,
                    visible,
                }
            }
        }
    }

    /// A monitor with no NVML handle.
    pub fn unavailable(visible: Vec<DeviceRef>) -> Self {
        Self {
            nvml: None,
            visible,
        }
    }

    pub fn is_available(&self) -> bool {
        self.nvml.is_some()
    }

    /// Host-side device references, in container-visible order.
    pub fn visible(&self) -> &[DeviceRef] {
        &self.visible
    }

    /// Container-visible index of `device`, if it is in the visible set.
    pub fn visible_index(&self, device: &DeviceRef) -> Option<u32> {
        self.visible
            .iter()
            .position(|d| d == device)
            .map(|i| i as u32)
    }

    /// Query every visible device. Devices that fail to answer carry
    /// `metrics: None`.
    pub fn sample(&self) -> Vec<GpuSnapshot> {
        self.visible
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let metrics = match self.metrics(device) {
                    Ok(m) => Some(m),
                    Err(ProbeError::GpuUnavailable) => None,
                    Err(e) => {
                        debug!(%device, error = %e, "GPU query failed");
                        None
                    }
                };
                GpuSnapshot {
                    device: device.clone(),
                    index: index as u32,
                    metrics,
                }
            })
            .collect()
    }

    /// Free/total memory and utilization of one device.
    pub fn metrics(&self, device: &DeviceRef) -> ProbeResult<GpuMetrics> {
        let nvml = self.nvml.as_ref().ok_or(ProbeError::GpuUnavailable)?;
        let handle = match device {
            DeviceRef::Index(i) => nvml.device_by_index(*i)?,
            DeviceRef::Uuid(uuid) => nvml.device_by_uuid(uuid.as_str())?,
        };
        let memory = handle.memory_info()?;
        let utilization = handle.utilization_rates()?;
        Ok(GpuMetrics {
            free_memory_mib: memory.free / MIB,
            total_memory_mib: memory.total / MIB,
            utilization_percent: utilization.gpu,
        })
    }

    /// Current utilization (percent) of a visible device.
    pub fn utilization(&self, device: &DeviceRef) -> ProbeResult<u32> {
        if self.nvml.is_none() {
            return Err(ProbeError::GpuUnavailable);
        }
        if self.visible_index(device).is_none() {
            return Err(ProbeError::UnknownDevice {
                device: device.clone(),
            });
        }
        Ok(self.metrics(device)?.utilization_percent)
    }
}

impl std::fmt::Debug for GpuMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuMonitor")
            .field("available", &self.is_available())
            .field("visible", &self.visible)
            .finish()
    }
}
