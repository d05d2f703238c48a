//! hive-autoscale — pure scaling policy.
//!
//! Everything here is a function of one tick's inputs (queue depth, pool
//! size, resource snapshot) and configuration. Executing a decision is the
//! scheduler's job.
//!
//! # Scaling Algorithm
//!
//! ```text
//! if size < min:                         Replace   (no core gate)
//! if evaluator && load_1m > cores
//!    && shedding && size > min:          Shed      (pre-empts depth)
//! if depth > threshold && size < max:    ScaleUp   (evaluator: core gate)
//! if depth < threshold && size > min:    ScaleDown
//! if size > max:                         ScaleDown
//! otherwise:                             NoChange
//! ```
//!
//! The core gate passes when strictly more than `min_idle_cores` available
//! cores sit below `core_usage_ceiling`.
//!
//! # Device Placement
//!
//! ```text
//! no NVML or no device answered         → Default
//! first device: free - reserved > hwm
//!               and util < ceiling       → Single (reserve hwm)
//! sum(free - reserved | util < ceiling)
//!               >= hwm                   → Combined
//! otherwise                              → PlacementError
//! ```

pub mod error;
pub mod placement;
pub mod scaler;
pub mod victim;

pub use error::PlacementError;
pub use placement::DevicePlanner;
pub use scaler::{ScaleDecision, ScalingPolicy, core_gate_open, needs_shedding};
pub use victim::{CPU_FALLBACK_IDLE_THRESHOLD, pick_least_busy};
