use std::fmt;

use crate::error::{WorkerError, WorkerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Connecting,
    Active,
    Draining,
    Terminated,
    /// Absorbing; the process exits non-zero.
    Failed,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Init, Connecting)
                | (Connecting, Active)
                | (Connecting, Failed)
                | (Active, Draining)
                | (Active, Failed)
                | (Draining, Terminated)
        )
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: WorkerState) -> WorkerResult<()> {
        if !self.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_final(self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Init => "init",
            WorkerState::Connecting => "connecting",
            WorkerState::Active => "active",
            WorkerState::Draining => "draining",
            WorkerState::Terminated => "terminated",
            WorkerState::Failed => "failed",
        };
        f.write_str(s)
    }
}
