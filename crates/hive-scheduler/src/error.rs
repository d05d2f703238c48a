//! Scheduler error types.

use thiserror::Error;

use hive_core::Pid;

/// Errors that can occur while managing worker pools.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker {pid} process error: {source}")]
    Process {
        pid: Pid,
        #[source]
        source: std::io::Error,
    },

    #[error("sampler start needs a device token")]
    MissingDevice,

    #[error("broker error: {0}")]
    Broker(#[from] hive_broker::BrokerError),

    #[error("resource probe error: {0}")]
    Probe(#[from] hive_probe::ProbeError),

    #[error("placement error: {0}")]
    Placement(#[from] hive_autoscale::PlacementError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
