//! hive-broker — message-broker sessions for the scheduler and workers.
//!
//! The scheduler uses a session to read queue depth once per tick; a
//! worker uses one to consume its input queue and publish into its
//! output queue. Both go through the [`BrokerSession`] trait so tests can
//! swap in [`MemoryBroker`].
//!
//! # Queue conventions
//!
//! Every queue is declared non-durable, not auto-delete, with
//! `x-consumer-timeout = 360000000`. Declaring with identical arguments
//! is a no-op; a mismatch is reported as
//! [`BrokerError::PreconditionFailed`]. Depth checks use a passive
//! declare on a short-lived channel, and a missing queue counts as empty.

pub mod amqp;
pub mod error;
pub mod memory;
pub mod queue;
pub mod session;

pub use amqp::{AmqpConnector, AmqpSession};
pub use error::{BrokerError, BrokerResult};
pub use memory::MemoryBroker;
pub use queue::QueueSpec;
pub use session::{BrokerConnector, BrokerSession, Delivery, redact_url};
