//! Probe error types.

use thiserror::Error;

use hive_core::{DeviceRef, Pid};

pub type ProbeResult<T> = Result<T, ProbeError>;

/// Errors raised while sampling host or GPU resources.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("GPU monitoring is unavailable")]
    GpuUnavailable,

    #[error("GPU {device} is not in the visible device set")]
    UnknownDevice { device: DeviceRef },

    #[error("GPU query failed: {0}")]
    Nvml(#[from] nvml_wrapper::error::NvmlError),

    #[error("no CPU cores are available to this process")]
    NoCores,

    #[error("process {0} not found")]
    ProcessGone(Pid),
}
