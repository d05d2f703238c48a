//! hive-worker — the lifecycle every worker process obeys.
//!
//! # State machine
//!
//! ```text
//! Init ──► Connecting ──► Active ──► Draining ──► Terminated
//!              │             │
//!              └─────┬───────┘
//!                    ▼
//!                 Failed
//! ```
//!
//! `Connecting → Active` needs a bounded broker connection and the
//! declaration of both queues of the pool's pair. A shutdown signal moves
//! `Active → Draining`: the in-flight message gets up to the drain
//! timeout, after which the handler task is aborted. The channel and the
//! connection are closed before the process exits 0. Broker failures end
//! in `Failed` and a non-zero exit, which the scheduler reaps.

pub mod device;
pub mod error;
pub mod handler;
pub mod runtime;
pub mod signal;
pub mod state;

pub use device::DeviceArg;
pub use error::{WorkerError, WorkerResult};
pub use handler::{CommandHandler, TaskHandler, WorkerQueues};
pub use runtime::{ShutdownState, WorkerRuntime};
pub use signal::os_signal;
pub use state::WorkerState;
