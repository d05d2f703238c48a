//! Broker error types.

use std::time::Duration;

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue {queue} declared with conflicting arguments: {reason}")]
    PreconditionFailed { queue: String, reason: String },

    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },

    #[error("session closed")]
    Closed,
}
