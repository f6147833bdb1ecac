//! Core domain models and shared primitives for the relay event pipeline.
//!
//! Provides strongly-typed identifiers, the event/config/delivery data
//! model, the storage repositories, and the clock abstraction. All other
//! crates depend on these foundational types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptOutcome, BackoffPolicy, BackoffStrategy, ClientId, ConfigId, DeliveryAttempt,
    DeliveryId, DeliveryStatus, EntityType, Event, EventDelivery, EventId, EventType,
    ProcessorConfig, QueueName, Target, TaskId,
};
pub use storage::Storage;
pub use time::{Clock, RealClock, TestClock};
