//! Durable task queue, producer, handler registry, and worker pool.
//!
//! Tasks are serde-tagged envelopes stored in a broker with lease-based
//! at-least-once delivery. A multi-queue worker pool dispatches leased
//! tasks through an explicit handler registry keyed by the closed
//! `TaskKind` enum.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod error;
pub mod pool;
pub mod producer;
pub mod queue;
pub mod registry;

pub use envelope::{DeliveryTask, TaskEnvelope, TaskKind, TaskPayload, WorkflowTask};
pub use error::{QueueError, Result};
pub use pool::{PoolConfig, PoolStats, QueueConfig, WorkerPool};
pub use producer::TaskProducer;
pub use queue::{LeasedTask, PgTaskQueue, TaskQueue};
pub use registry::{RedeliveryPolicy, TaskError, TaskErrorKind, TaskHandler, TaskRegistry};
