//! Handler registry mapping task kinds to their executors.
//!
//! The registry is an explicit object built at startup and handed to the
//! worker pool; there is no process-global registration. Dispatch is over
//! the closed `TaskKind` enum, and a dequeued task whose kind has no entry
//! is an explicit error path, not a silent drop.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::envelope::{TaskEnvelope, TaskKind};

/// Classification of a handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// Re-running cannot help; the task is acked and dropped.
    Permanent,
    /// Worth re-running. The broker redelivers after `retry_after` when
    /// given, or after the queue's redelivery policy delay otherwise.
    Transient {
        /// Caller-computed redelivery delay, when the domain knows better
        /// than the queue policy.
        retry_after: Option<Duration>,
    },
}

/// Failure returned by a task handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether redelivery can help.
    pub kind: TaskErrorKind,
}

impl TaskError {
    /// A failure that redelivery cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: TaskErrorKind::Permanent }
    }

    /// A failure worth redelivering, delayed per the queue policy.
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), kind: TaskErrorKind::Transient { retry_after: None } }
    }

    /// A transient failure with a caller-computed redelivery delay.
    pub fn retry_after(message: impl Into<String>, delay: Duration) -> Self {
        Self {
            message: message.into(),
            kind: TaskErrorKind::Transient { retry_after: Some(delay) },
        }
    }

    /// Whether redelivery can help.
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, TaskErrorKind::Transient { .. })
    }
}

/// Executes one kind of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs the task to completion.
    ///
    /// # Errors
    ///
    /// Returns `TaskError` with a transient/permanent classification; the
    /// pool turns transient failures into broker redeliveries.
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), TaskError>;
}

/// Broker-level redelivery timing for one task kind.
///
/// This governs infrastructure retries (worker crashes, transient handler
/// failures without an explicit delay). Domain retry timing for deliveries
/// lives in the per-config backoff policy and reaches the broker as an
/// explicit `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    /// Base redelivery delay.
    pub base_delay: Duration,
    /// Upper bound on any redelivery delay.
    pub max_delay: Duration,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self { base_delay: Duration::from_secs(5), max_delay: Duration::from_secs(300) }
    }
}

impl RedeliveryPolicy {
    /// Delay before the n-th redelivery, linear in `receive_count`.
    pub fn delay(&self, receive_count: i32) -> Duration {
        let n = u32::try_from(receive_count.max(1)).unwrap_or(1);
        self.base_delay.saturating_mul(n).min(self.max_delay)
    }
}

struct Registration {
    handler: Arc<dyn TaskHandler>,
    redelivery: RedeliveryPolicy,
}

/// Immutable kind-to-handler mapping consumed by the worker pool.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Registration>,
}

impl TaskRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a kind with the default redelivery policy.
    #[must_use]
    pub fn with_handler(self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.with_handler_and_policy(kind, handler, RedeliveryPolicy::default())
    }

    /// Registers a handler for a kind with an explicit redelivery policy.
    ///
    /// Re-registering a kind replaces the previous entry.
    #[must_use]
    pub fn with_handler_and_policy(
        mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
        redelivery: RedeliveryPolicy,
    ) -> Self {
        self.handlers.insert(kind, Registration { handler, redelivery });
        self
    }

    /// Resolves the handler and redelivery policy for a kind.
    pub fn resolve(&self, kind: TaskKind) -> Option<(Arc<dyn TaskHandler>, RedeliveryPolicy)> {
        self.handlers.get(&kind).map(|r| (r.handler.clone(), r.redelivery))
    }

    /// Kinds with a registered handler.
    pub fn registered_kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().copied().collect()
    }
}
