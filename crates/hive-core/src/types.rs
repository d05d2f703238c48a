//! Shared types used across Hive crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// OS process identifier of a worker.
pub type Pid = u32;

/// Queue consumed by samplers.
pub const SAMPLER_QUEUE: &str = "sampler_queue";
/// Queue filled by samplers and consumed by evaluators.
pub const EVALUATOR_QUEUE: &str = "evaluator_queue";
/// Queue filled by evaluators.
pub const DATABASE_QUEUE: &str = "database_queue";

/// `x-consumer-timeout` argument every queue is declared with, in ms.
pub const CONSUMER_TIMEOUT_MS: i64 = 360_000_000;

/// The two kinds of worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// CPU-bound workers that score candidate programs.
    Evaluator,
    /// GPU-bound workers that run model inference.
    Sampler,
}

impl PoolKind {
    /// Queue this pool's workers consume from.
    pub fn input_queue(&self) -> &'static str {
        match self {
            PoolKind::Evaluator => EVALUATOR_QUEUE,
            PoolKind::Sampler => SAMPLER_QUEUE,
        }
    }

    /// Queue this pool's workers publish results into.
    pub fn output_queue(&self) -> &'static str {
        match self {
            PoolKind::Evaluator => DATABASE_QUEUE,
            PoolKind::Sampler => EVALUATOR_QUEUE,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PoolKind::Evaluator => "evaluator",
            PoolKind::Sampler => "sampler",
        }
    }

    /// Whether workers of this kind need a device token at spawn.
    pub fn needs_device(&self) -> bool {
        match self {
            PoolKind::Evaluator => false,
            PoolKind::Sampler => true,
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPoolKind(pub String);

impl fmt::Display for UnknownPoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown pool kind: {} (expected evaluator or sampler)", self.0)
    }
}

impl std::error::Error for UnknownPoolKind {}

impl FromStr for PoolKind {
    type Err = UnknownPoolKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evaluator" => Ok(PoolKind::Evaluator),
            "sampler" => Ok(PoolKind::Sampler),
            other => Err(UnknownPoolKind(other.to_string())),
        }
    }
}

/// Host-side reference to a GPU, as listed in the visible-device set.
///
/// Resolved once when the probe starts. Downstream code matches on the
/// variant instead of re-parsing strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeviceRef {
    Index(u32),
    Uuid(String),
}

impl DeviceRef {
    /// Parse one entry of a visible-device list. Blank entries yield `None`.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        match entry.parse::<u32>() {
            Ok(index) => Some(DeviceRef::Index(index)),
            Err(_) => Some(DeviceRef::Uuid(entry.to_string())),
        }
    }

    /// Parse a comma-separated visible-device list such as `"0,2"`.
    pub fn parse_list(list: &str) -> Vec<Self> {
        list.split(',').filter_map(DeviceRef::parse).collect()
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Index(i) => write!(f, "{i}"),
            DeviceRef::Uuid(u) => f.write_str(u),
        }
    }
}

/// Device assignment handed to a sampler at spawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeviceToken {
    /// One GPU. `index` is the container-visible ordinal.
    Single { device: DeviceRef, index: u32 },
    /// Spread the model across every device with headroom.
    Combined,
    /// GPU metrics unavailable; let the runtime choose.
    Default,
}

impl DeviceToken {
    /// The GPU this token pins, if any.
    pub fn device(&self) -> Option<&DeviceRef> {
        match self {
            DeviceToken::Single { device, .. } => Some(device),
            DeviceToken::Combined | DeviceToken::Default => None,
        }
    }
}

impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceToken::Single { index, .. } => write!(f, "cuda:{index}"),
            DeviceToken::Combined | DeviceToken::Default => f.write_str("cuda"),
        }
    }
}

/// Queue-depth threshold and pool bounds for one pool kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingThresholds {
    /// Depth above which the pool grows and below which it shrinks.
    pub queue_threshold: u32,
    pub min: u32,
    pub max: u32,
}

impl ScalingThresholds {
    pub fn new(queue_threshold: u32, min: u32, max: u32) -> Self {
        Self {
            queue_threshold,
            min,
            max,
        }
    }

    /// Clamp a requested pool size into `[min, max]`.
    pub fn clamp(&self, size: u32) -> u32 {
        size.clamp(self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_kind_queue_pairs() {
        assert_eq!(PoolKind::Sampler.input_queue(), "sampler_queue");
        assert_eq!(PoolKind::Sampler.output_queue(), "evaluator_queue");
        assert_eq!(PoolKind::Evaluator.input_queue(), "evaluator_queue");
        assert_eq!(PoolKind::Evaluator.output_queue(), "database_queue");
    }

    #[test]
    fn pool_kind_from_str() {
        assert_eq!("Sampler".parse::<PoolKind>(), Ok(PoolKind::Sampler));
        assert_eq!(" evaluator ".parse::<PoolKind>(), Ok(PoolKind::Evaluator));
        assert!("database".parse::<PoolKind>().is_err());
    }

    #[test]
    fn device_ref_parses_index_and_uuid() {
        assert_eq!(DeviceRef::parse("3"), Some(DeviceRef::Index(3)));
        assert_eq!(
            DeviceRef::parse(" GPU-8f2a "),
            Some(DeviceRef::Uuid("GPU-8f2a".to_string()))
        );
        assert_eq!(DeviceRef::parse("  "), None);
    }

    #[test]
    fn device_list_skips_blank_entries() {
        let devices = DeviceRef::parse_list("0, 2,,MIG-abc");
        assert_eq!(
            devices,
            vec![
                DeviceRef::Index(0),
                DeviceRef::Index(2),
                DeviceRef::Uuid("MIG-abc".to_string()),
            ]
        );
    }

    #[test]
    fn device_token_rendering() {
        let single = DeviceToken::Single {
            device: DeviceRef::Index(5),
            index: 1,
        };
        assert_eq!(single.to_string(), "cuda:1");
        assert_eq!(single.device(), Some(&DeviceRef::Index(5)));
        assert_eq!(DeviceToken::Combined.to_string(), "cuda");
        assert_eq!(DeviceToken::Default.device(), None);
    }

    #[test]
    fn thresholds_clamp() {
        let t = ScalingThresholds::new(5, 1, 4);
        assert_eq!(t.clamp(0), 1);
        assert_eq!(t.clamp(3), 3);
        assert_eq!(t.clamp(9), 4);
    }
}
