//! Worker error types.

use thiserror::Error;

use hive_broker::BrokerError;

use crate::state::WorkerState;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("illegal worker transition {from} -> {to}")]
    InvalidTransition { from: WorkerState, to: WorkerState },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("unit of work cancelled")]
    Cancelled,

    #[error("invalid device argument: {0} (expected cuda or cuda:<index>)")]
    InvalidDevice(String),

    #[error("sampler workers need a device argument")]
    MissingDevice,

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("input queue consumer closed by broker")]
    ConsumerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
