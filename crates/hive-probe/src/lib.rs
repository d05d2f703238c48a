//! hive-probe — read-only resource snapshots for the scaling loop.
//!
//! Produces an immutable [`ResourceSnapshot`] per control-loop tick:
//! load averages, the cores this process may run on and their
//! utilization, and free memory / utilization for every visible GPU.
//!
//! # Architecture
//!
//! ```text
//! ResourceProbe (trait)
//!   └── SystemProbe
//!       ├── sysinfo::System   → per-core usage, load, per-process CPU
//!       ├── sched_getaffinity → cores available to this process
//!       └── GpuMonitor (NVML, initialized once; degrades if absent)
//!
//! ResourceReporter
//!   └── run() → periodic resource log lines until shutdown
//! ```
//!
//! GPU monitoring failure is never fatal: the snapshot reports
//! `gpu_monitoring = false` and sampler placement falls back to the
//! runtime's default device.

pub mod error;
pub mod gpu;
pub mod probe;
pub mod reporter;
pub mod snapshot;

pub use error::{ProbeError, ProbeResult};
pub use gpu::GpuMonitor;
pub use probe::{ResourceProbe, SystemProbe};
pub use reporter::ResourceReporter;
pub use snapshot::{GpuMetrics, GpuSnapshot, LoadAverage, ResourceSnapshot};
