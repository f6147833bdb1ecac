//! Synchronous task production with a bounded retry budget.

use std::{sync::Arc, time::Duration};

use relay_core::{Clock, QueueName, TaskId};
use tracing::warn;

use crate::{
    envelope::{TaskEnvelope, TaskPayload},
    error::{QueueError, Result},
    queue::TaskQueue,
};

/// Number of immediate re-attempts on a broker error before surfacing it.
const DEFAULT_ENQUEUE_RETRIES: u32 = 2;

/// Delay between producer enqueue re-attempts.
const ENQUEUE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Produces durable tasks for the worker pool.
///
/// Enqueue is synchronous: when `enqueue` returns Ok the task is stored in
/// the broker. Transient broker errors are retried a bounded number of
/// times before being surfaced, so a brief connection blip does not bubble
/// into the caller's write path.
pub struct TaskProducer {
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl TaskProducer {
    /// Creates a producer over the given broker.
    pub fn new(queue: Arc<dyn TaskQueue>, clock: Arc<dyn Clock>) -> Self {
        Self { queue, clock, max_retries: DEFAULT_ENQUEUE_RETRIES }
    }

    /// Overrides the enqueue retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builds an envelope around `payload` and durably enqueues it.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Serialization` if the payload cannot be
    /// encoded, or the last broker error once the retry budget is spent.
    pub async fn enqueue(&self, queue: QueueName, payload: TaskPayload) -> Result<TaskId> {
        let envelope = TaskEnvelope::new(payload, self.clock.now_utc());
        // Fail serialization up front rather than inside the retry loop.
        envelope.to_json()?;

        let mut attempt = 0;
        loop {
            match self.queue.enqueue(queue, envelope.clone()).await {
                Ok(task_id) => return Ok(task_id),
                Err(err @ QueueError::Serialization(_)) => return Err(err),
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        queue = %queue,
                        kind = %envelope.kind(),
                        attempt,
                        error = %err,
                        "task enqueue failed, retrying"
                    );
                    self.clock.sleep(ENQUEUE_RETRY_DELAY).await;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use relay_core::TestClock;

    use super::*;
    use crate::{
        envelope::WorkflowTask,
        queue::{memory::InMemoryTaskQueue, LeasedTask},
    };

    fn workflow_payload() -> TaskPayload {
        TaskPayload::Workflow(WorkflowTask {
            workflow: "archive".into(),
            input: serde_json::json!({}),
        })
    }

    /// Broker that fails the first `failures` enqueues.
    struct FlakyQueue {
        inner: InMemoryTaskQueue,
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl TaskQueue for FlakyQueue {
        async fn enqueue(&self, queue: QueueName, envelope: TaskEnvelope) -> Result<TaskId> {
            if self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(QueueError::broker("connection reset"));
            }
            self.inner.enqueue(queue, envelope).await
        }

        async fn dequeue(
            &self,
            queue: QueueName,
            max: usize,
            visibility: Duration,
        ) -> Result<Vec<LeasedTask>> {
            self.inner.dequeue(queue, max, visibility).await
        }

        async fn ack(&self, task_id: TaskId) -> Result<()> {
            self.inner.ack(task_id).await
        }

        async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<()> {
            self.inner.nack(task_id, delay).await
        }
    }

    #[tokio::test]
    async fn enqueue_stores_the_task() {
        let clock = TestClock::new();
        let queue = Arc::new(InMemoryTaskQueue::new(Arc::new(clock.clone())));
        let producer = TaskProducer::new(queue.clone(), Arc::new(clock));

        producer.enqueue(QueueName::Workflow, workflow_payload()).await.unwrap();

        assert_eq!(queue.len_for(QueueName::Workflow).await, 1);
    }

    #[tokio::test]
    async fn enqueue_retries_transient_broker_errors() {
        let clock = TestClock::new();
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryTaskQueue::new(Arc::new(clock.clone())),
            remaining_failures: AtomicU32::new(2),
        });
        let producer = TaskProducer::new(queue.clone(), Arc::new(clock));

        producer.enqueue(QueueName::Default, workflow_payload()).await.unwrap();

        assert_eq!(queue.inner.len().await, 1);
    }

    #[tokio::test]
    async fn enqueue_surfaces_the_error_once_the_budget_is_spent() {
        let clock = TestClock::new();
        let queue = Arc::new(FlakyQueue {
            inner: InMemoryTaskQueue::new(Arc::new(clock.clone())),
            remaining_failures: AtomicU32::new(10),
        });
        let producer = TaskProducer::new(queue.clone(), Arc::new(clock)).with_max_retries(1);

        let result = producer.enqueue(QueueName::Default, workflow_payload()).await;

        assert!(matches!(result, Err(QueueError::Broker(_))));
        assert!(queue.inner.is_empty().await);
    }
}
