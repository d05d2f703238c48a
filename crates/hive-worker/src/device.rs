//! Device argument handed to sampler workers.

use std::fmt;
use std::str::FromStr;

use crate::error::WorkerError;

/// Parsed `--device` value: `cuda` or `cuda:<index>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceArg {
    /// Let the runtime choose, or spread across devices.
    Any,
    Index(u32),
}

impl FromStr for DeviceArg {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "cuda" {
            return Ok(DeviceArg::Any);
        }
        s.strip_prefix("cuda:")
            .and_then(|i| i.parse::<u32>().ok())
            .map(DeviceArg::Index)
            .ok_or_else(|| WorkerError::InvalidDevice(s.to_string()))
    }
}

impl fmt::Display for DeviceArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceArg::Any => f.write_str("cuda"),
            DeviceArg::Index(i) => write!(f, "cuda:{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_core::{DeviceRef, DeviceToken};

    #[test]
    fn parses_any_and_index() {
        assert_eq!("cuda".parse::<DeviceArg>().unwrap(), DeviceArg::Any);
        assert_eq!("cuda:3".parse::<DeviceArg>().unwrap(), DeviceArg::Index(3));
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["gpu0", "cuda:", "cuda:x", "cuda:-1", ""] {
            assert!(bad.parse::<DeviceArg>().is_err(), "{bad}");
        }
    }

    #[test]
    fn round_trips_device_tokens() {
        let tokens = [
            DeviceToken::Single {
                device: DeviceRef::Uuid("GPU-1".into()),
                index: 2,
            },
            DeviceToken::Combined,
            DeviceToken::Default,
        ];
        for token in tokens {
            let arg: DeviceArg = token.to_string().parse().unwrap();
            assert_eq!(arg.to_string(), token.to_string());
        }
    }
}
