//! Periodic resource log lines.

use std::time::Duration;

use tracing::{info, warn};

use hive_core::Pid;

use crate::probe::ResourceProbe;
use crate::snapshot::ResourceSnapshot;

/// One report, as logged.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReport {
    pub snapshot: ResourceSnapshot,
    pub average_cpu: f32,
    pub rss_bytes: Option<u64>,
    pub load_ratio: f64,
}

/// Logs host and GPU usage on a fixed interval until shutdown.
pub struct ResourceReporter {
    probe: Box<dyn ResourceProbe>,
    interval: Duration,
    pid: Pid,
}

impl ResourceReporter {
    /// Report through `probe` every `interval`, tagging this process's pid.
    pub fn new(probe: Box<dyn ResourceProbe>, interval: Duration) -> Self {
        Self {
            probe,
            interval,
            pid: std::process::id(),
        }
    }

    /// Sample once.
    pub async fn report(&mut self) -> Option<ResourceReport> {
        let snapshot = match self.probe.snapshot().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "resource report failed");
                return None;
            }
        };
        Some(ResourceReport {
            average_cpu: snapshot.average_core_usage(),
            load_ratio: snapshot.load_ratio(),
            rss_bytes: self.probe.resident_memory(self.pid),
            snapshot,
        })
    }

    fn log(report: &ResourceReport) {
        let snap = &report.snapshot;
        info!(
            cores = snap.available_cores,
            avg_cpu = format_args!("{:.1}", report.average_cpu),
            rss_mib = report.rss_bytes.map(|b| b / (1024 * 1024)),
            load_1m = snap.load.one,
            load_5m = snap.load.five,
            load_15m = snap.load.fifteen,
            load_ratio = format_args!("{:.2}", report.load_ratio),
            "resource usage"
        );
        if !snap.gpu_monitoring {
            info!("GPU monitoring unavailable");
            return;
        }
        for gpu in &snap.gpus {
            match gpu.metrics {
                Some(m) => info!(
                    device = %gpu.device,
                    index = gpu.index,
                    free_mib = m.free_memory_mib,
                    total_mib = m.total_memory_mib,
                    utilization = m.utilization_percent,
                    "GPU usage"
                ),
                None => warn!(device = %gpu.device, "GPU metrics unavailable"),
            }
        }
    }

    /// Report every `interval` until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "resource reporter started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Some(report) = self.report().await {
                        Self::log(&report);
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource reporter shutting down");
                    break;
                }
            }
        }
    }
}
