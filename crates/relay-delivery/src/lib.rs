//! Event fan-out and delivery execution.
//!
//! `EventPublisher` resolves matching processor configs and creates
//! tracked deliveries; `DeliveryTracker` owns the delivery state machine;
//! `DeliveryTaskHandler` executes attempts over HTTP with per-config
//! backoff between retries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod client;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod storage;
pub mod tracking;
pub mod workflow;

pub use client::{ClientConfig, DeliveryClient, DeliveryResponse};
pub use error::{DeliveryError, Result};
pub use handler::DeliveryTaskHandler;
pub use publisher::EventPublisher;
pub use storage::{DeliveryStore, PostgresDeliveryStore};
pub use tracking::{AttemptDisposition, ClaimMiss, ClaimedDelivery, DeliveryTracker};
pub use workflow::{LoggingWorkflowRunner, WorkflowRunner, WorkflowTaskHandler};
