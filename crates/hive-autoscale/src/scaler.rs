//! Queue-driven scaling decisions.
//!
//! One decision per tick: at most one start or one termination, except
//! load shedding, which the executor repeats with a recheck after each
//! termination.

use tracing::debug;

use hive_core::{CpuGate, PoolKind, PoolSettings, ScalingThresholds, SheddingSettings};
use hive_probe::{LoadAverage, ResourceSnapshot};

/// What the executor should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Start one worker (subject to placement for samplers).
    ScaleUp,
    /// Gracefully stop one idle worker.
    ScaleDown,
    /// The pool fell below min; start one replacement.
    Replace,
    /// Host is overloaded; force-stop the oldest worker and recheck.
    Shed,
    NoChange,
}

/// Whether the evaluator core gate lets another worker in.
///
/// Strictly more than `min_idle_cores` must sit below the ceiling.
pub fn core_gate_open(snapshot: &ResourceSnapshot, gate: &CpuGate) -> bool {
    snapshot.cores_below(gate.core_usage_ceiling) > gate.min_idle_cores
}

/// Whether one more worker should be shed right now.
pub fn needs_shedding(load: &LoadAverage, cores: usize, size: u32, min: u32) -> bool {
    load.exceeds(cores) && size > min
}

/// Scaling policy for one pool.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    kind: PoolKind,
    thresholds: ScalingThresholds,
    cpu_gate: CpuGate,
    shedding: SheddingSettings,
}

impl ScalingPolicy {
    pub fn new(pool: &PoolSettings, cpu_gate: CpuGate, shedding: SheddingSettings) -> Self {
        Self {
            kind: pool.kind,
            thresholds: pool.thresholds,
            cpu_gate,
            shedding,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn thresholds(&self) -> &ScalingThresholds {
        &self.thresholds
    }

    pub fn shedding(&self) -> &SheddingSettings {
        &self.shedding
    }

    /// Whether this pool sheds load at all.
    pub fn sheds_load(&self) -> bool {
        self.kind == PoolKind::Evaluator && self.shedding.enabled
    }

    /// Depth-only decision, ignoring host resources.
    pub fn queue_decision(&self, depth: u32, size: u32) -> ScaleDecision {
        let t = &self.thresholds;
        if size < t.min {
            ScaleDecision::Replace
        } else if depth > t.queue_threshold && size < t.max {
            ScaleDecision::ScaleUp
        } else if (depth < t.queue_threshold && size > t.min) || size > t.max {
            ScaleDecision::ScaleDown
        } else {
            ScaleDecision::NoChange
        }
    }

    /// Full decision for one tick.
    pub fn decide(&self, depth: u32, size: u32, snapshot: &ResourceSnapshot) -> ScaleDecision {
        let queue = self.queue_decision(depth, size);
        if queue == ScaleDecision::Replace {
            return queue;
        }

        if self.sheds_load()
            && needs_shedding(
                &snapshot.load,
                snapshot.available_cores,
                size,
                self.thresholds.min,
            )
        {
            debug!(
                pool = %self.kind,
                load_1m = snapshot.load.one,
                cores = snapshot.available_cores,
                "host overloaded"
            );
            return ScaleDecision::Shed;
        }

        if queue == ScaleDecision::ScaleUp
            && self.kind == PoolKind::Evaluator
            && !core_gate_open(snapshot, &self.cpu_gate)
        {
            debug!(
                pool = %self.kind,
                idle_cores = snapshot.cores_below(self.cpu_gate.core_usage_ceiling),
                required = self.cpu_gate.min_idle_cores + 1,
                depth,
                "core gate closed, not scaling up"
            );
            return ScaleDecision::NoChange;
        }

        queue
    }
}
