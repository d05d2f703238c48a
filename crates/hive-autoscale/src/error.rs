use thiserror::Error;

/// No visible GPU combination can host another sampler right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("insufficient GPU memory: need {needed_mib} MiB, {available_mib} MiB free on eligible devices")]
pub struct PlacementError {
    pub needed_mib: u64,
    pub available_mib: u64,
}
