pub mod config;
pub mod types;

pub use config::{
    ConfigError, CpuGate, HandlerSettings, HiveConfig, PlacementSettings, PoolSettings, Settings,
    SheddingSettings, parse_duration,
};
pub use types::*;
