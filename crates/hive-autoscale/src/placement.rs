//! GPU placement for sampler starts.
//!
//! A [`DevicePlanner`] lives for one decision batch. Its reservation
//! ledger makes two starts in the same batch see each other's claims, so a
//! device is only handed out twice if its free memory still clears the
//! high-water mark after the first reservation.

use std::collections::HashMap;

use tracing::{debug, info};

use hive_core::{DeviceRef, DeviceToken, PlacementSettings};
use hive_probe::{GpuSnapshot, ResourceSnapshot};

use crate::error::PlacementError;

#[derive(Debug)]
pub struct DevicePlanner {
    gpus: Vec<GpuSnapshot>,
    gpu_monitoring: bool,
    settings: PlacementSettings,
    /// MiB reserved per device during this batch.
    reserved: HashMap<DeviceRef, u64>,
}

impl DevicePlanner {
    pub fn new(snapshot: &ResourceSnapshot, settings: PlacementSettings) -> Self {
        Self {
            gpus: snapshot.gpus.clone(),
            gpu_monitoring: snapshot.gpu_monitoring,
            settings,
            reserved: HashMap::new(),
        }
    }

    fn reserved_on(&self, device: &DeviceRef) -> u64 {
        self.reserved.get(device).copied().unwrap_or(0)
    }

    /// Choose a device token for the next sampler start.
    pub fn place(&mut self) -> Result<DeviceToken, PlacementError> {
        if !self.gpu_monitoring {
            debug!("GPU monitoring unavailable, using default device");
            return Ok(DeviceToken::Default);
        }

        let ceiling = self.settings.utilization_ceiling;
        let high_water = self.settings.high_water_mib;

        // (device, index, free after reservations) for devices under the ceiling.
        let mut eligible = Vec::new();
        let mut queried = 0usize;
        for gpu in &self.gpus {
            let Some(metrics) = gpu.metrics else {
                continue;
            };
            queried += 1;
            if let Some(ceiling) = ceiling
                && metrics.utilization_percent >= ceiling
            {
                debug!(
                    device = %gpu.device,
                    utilization = metrics.utilization_percent,
                    "GPU above utilization ceiling"
                );
                continue;
            }
            let free = metrics
                .free_memory_mib
                .saturating_sub(self.reserved_on(&gpu.device));
            eligible.push((gpu.device.clone(), gpu.index, free));
        }

        if queried == 0 {
            debug!("no GPU answered, using default device");
            return Ok(DeviceToken::Default);
        }

        if let Some((device, index, free)) = eligible
            .iter()
            .find(|(_, _, free)| *free > high_water)
            .cloned()
        {
            *self.reserved.entry(device.clone()).or_insert(0) += high_water;
            info!(%device, index, free_mib = free, "placing sampler on single GPU");
            return Ok(DeviceToken::Single { device, index });
        }

        let combined: u64 = eligible.iter().map(|(_, _, free)| free).sum();
        if combined >= high_water {
            info!(
                devices = eligible.len(),
                free_mib = combined,
                "placing sampler across combined GPUs"
            );
            return Ok(DeviceToken::Combined);
        }

        Err(PlacementError {
            needed_mib: high_water,
            available_mib: combined,
        })
    }
}
