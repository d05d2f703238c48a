//! Queue declaration arguments.

use hive_core::CONSUMER_TIMEOUT_MS;

/// Arguments a queue is declared with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// `x-consumer-timeout`, in milliseconds.
    pub consumer_timeout_ms: i64,
}

impl QueueSpec {
    /// The declaration every Hive queue uses.
    pub fn standard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            consumer_timeout_ms: CONSUMER_TIMEOUT_MS,
        }
    }

    /// Describe the first argument that differs from `other`.
    pub fn mismatch(&self, other: &QueueSpec) -> Option<String> {
        if self.durable != other.durable {
            return Some(format!("durable {} != {}", self.durable, other.durable));
        }
        if self.auto_delete != other.auto_delete {
            return Some(format!(
                "auto_delete {} != {}",
                self.auto_delete, other.auto_delete
            ));
        }
        if self.consumer_timeout_ms != other.consumer_timeout_ms {
            return Some(format!(
                "x-consumer-timeout {} != {}",
                self.consumer_timeout_ms, other.consumer_timeout_ms
            ));
        }
        None
    }
}
