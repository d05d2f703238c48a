//! hive-scheduler — worker pools and the scaling control loop.
//!
//! One [`TaskManager`] owns one [`WorkerPool`]. Every tick it reaps exited
//! workers, reads the input queue's depth and a resource snapshot, and
//! hands both to the [`ResourceManager`], which turns the pool's
//! [`ScalingPolicy`](hive_autoscale::ScalingPolicy) decision into process
//! starts and terminations.
//!
//! # Architecture
//!
//! ```text
//! TaskManager (one per pool kind, &mut self, no locks)
//!   ├── BrokerConnector → session (queue depth, reconnect per tick)
//!   ├── ResourceProbe   → ResourceSnapshot
//!   ├── ResourceManager
//!   │     ├── ScalingPolicy  (hive-autoscale)
//!   │     ├── DevicePlanner  (one ledger per decision batch)
//!   │     └── victim ranking (CPU, or GPU with CPU fallback)
//!   └── WorkerPool
//!         └── WorkerHandle { pid, device, created_at, process }
//!               └── WorkerProcess (OS child via WorkerLauncher)
//! ```

pub mod error;
pub mod launcher;
pub mod pool;
pub mod resource_manager;
pub mod task_manager;
pub mod testing;

pub use error::{SchedulerError, SchedulerResult};
pub use launcher::{OsProcess, ProcessLauncher, WorkerExit, WorkerLauncher, WorkerProcess, WorkerSpec};
pub use pool::{WorkerHandle, WorkerPool};
pub use resource_manager::{ResourceManager, TickOutcome};
pub use task_manager::TaskManager;
