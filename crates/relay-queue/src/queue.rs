//! Task broker abstraction with lease-based at-least-once semantics.
//!
//! `PgTaskQueue` is the production broker: a Postgres table claimed with
//! `FOR UPDATE SKIP LOCKED` and a `visible_at` lease. A task whose worker
//! dies becomes visible again when its lease expires, so redelivery falls
//! out of the lease model with no extra machinery. `memory::InMemoryTaskQueue`
//! mirrors the same semantics for deterministic tests.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{Clock, QueueName, TaskId};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    envelope::TaskEnvelope,
    error::{QueueError, Result},
};

/// A task leased to a worker.
///
/// The envelope is kept as raw JSON so one undecodable task cannot fail a
/// whole dequeue batch; the pool decodes at dispatch time.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    /// Broker identifier, used for ack/nack.
    pub task_id: TaskId,
    /// Queue the task was leased from.
    pub queue: QueueName,
    /// Stored envelope JSON.
    pub envelope: Value,
    /// How many times this task has been leased, this lease included.
    pub receive_count: i32,
}

impl LeasedTask {
    /// Decodes the stored envelope.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::UnknownTaskKind` for an unrecognized kind tag,
    /// `QueueError::Serialization` for any other malformed envelope.
    pub fn decode(&self) -> Result<TaskEnvelope> {
        TaskEnvelope::from_json(self.envelope.clone())
    }
}

/// Durable task broker.
///
/// Dequeued tasks are leased, not removed: a task stays invisible for the
/// visibility timeout and reappears unless acked. `nack` shortens or
/// extends that wait explicitly.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Durably stores a task on the given queue.
    async fn enqueue(&self, queue: QueueName, envelope: TaskEnvelope) -> Result<TaskId>;

    /// Leases up to `max` visible tasks from the given queue.
    ///
    /// Each returned task is invisible to other consumers for `visibility`
    /// and has its `receive_count` incremented.
    async fn dequeue(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<LeasedTask>>;

    /// Removes a completed task permanently.
    async fn ack(&self, task_id: TaskId) -> Result<()>;

    /// Returns a task to the queue, visible again after `delay`.
    async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<()>;
}

/// Postgres-backed broker.
pub struct PgTaskQueue {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PgTaskQueue {
    /// Creates a broker over the given pool.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, queue: QueueName, envelope: TaskEnvelope) -> Result<TaskId> {
        let id = TaskId::new();
        let now = self.clock.now_utc();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, queue, envelope, enqueued_at, visible_at, receive_count)
            VALUES ($1, $2, $3, $4, $4, 0)
            "#,
        )
        .bind(id)
        .bind(queue)
        .bind(envelope.to_json()?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn dequeue(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<LeasedTask>> {
        let now = self.clock.now_utc();
        let lease_until = now
            + chrono::Duration::from_std(visibility)
                .map_err(|e| QueueError::broker(e.to_string()))?;

        let mut tx = self.pool.begin().await?;

        // FOR UPDATE SKIP LOCKED lets concurrent workers claim disjoint
        // tasks without blocking each other.
        let task_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE queue = $1 AND visible_at <= $2
            ORDER BY enqueued_at ASC
            LIMIT $3
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if task_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows: Vec<(TaskId, QueueName, Value, i32)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET visible_at = $2, receive_count = receive_count + 1
            WHERE id = ANY($1)
            RETURNING id, queue, envelope, receive_count
            "#,
        )
        .bind(&task_ids)
        .bind(lease_until)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|(task_id, queue, envelope, receive_count)| LeasedTask {
                task_id,
                queue,
                envelope,
                receive_count,
            })
            .collect())
    }

    async fn ack(&self, task_id: TaskId) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownTask(task_id));
        }

        Ok(())
    }

    async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<()> {
        let visible_at = self.clock.now_utc()
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::broker(e.to_string()))?;

        let result = sqlx::query("UPDATE tasks SET visible_at = $2 WHERE id = $1")
            .bind(task_id)
            .bind(visible_at)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownTask(task_id));
        }

        Ok(())
    }
}

/// In-memory broker with the same lease semantics, for tests.
pub mod memory {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    struct StoredTask {
        queue: QueueName,
        envelope: Value,
        enqueued_at: DateTime<Utc>,
        visible_at: DateTime<Utc>,
        receive_count: i32,
    }

    /// Deterministic in-process broker driven by an injected clock.
    pub struct InMemoryTaskQueue {
        tasks: Mutex<HashMap<TaskId, StoredTask>>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryTaskQueue {
        /// Creates an empty broker.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self { tasks: Mutex::new(HashMap::new()), clock }
        }

        /// Number of stored tasks, leased or not.
        pub async fn len(&self) -> usize {
            self.tasks.lock().await.len()
        }

        /// Whether the broker holds no tasks.
        pub async fn is_empty(&self) -> bool {
            self.tasks.lock().await.is_empty()
        }

        /// Number of stored tasks on one queue.
        pub async fn len_for(&self, queue: QueueName) -> usize {
            self.tasks.lock().await.values().filter(|t| t.queue == queue).count()
        }
    }

    #[async_trait]
    impl TaskQueue for InMemoryTaskQueue {
        async fn enqueue(&self, queue: QueueName, envelope: TaskEnvelope) -> Result<TaskId> {
            let id = TaskId::new();
            let now = self.clock.now_utc();

            self.tasks.lock().await.insert(
                id,
                StoredTask {
                    queue,
                    envelope: envelope.to_json()?,
                    enqueued_at: now,
                    visible_at: now,
                    receive_count: 0,
                },
            );

            Ok(id)
        }

        async fn dequeue(
            &self,
            queue: QueueName,
            max: usize,
            visibility: Duration,
        ) -> Result<Vec<LeasedTask>> {
            let now = self.clock.now_utc();
            let lease_until = now
                + chrono::Duration::from_std(visibility)
                    .map_err(|e| QueueError::broker(e.to_string()))?;

            let mut tasks = self.tasks.lock().await;

            let mut visible: Vec<TaskId> = tasks
                .iter()
                .filter(|(_, t)| t.queue == queue && t.visible_at <= now)
                .map(|(id, _)| *id)
                .collect();
            visible.sort_by_key(|id| tasks[id].enqueued_at);
            visible.truncate(max);

            let mut leased = Vec::with_capacity(visible.len());
            for id in visible {
                if let Some(task) = tasks.get_mut(&id) {
                    task.visible_at = lease_until;
                    task.receive_count += 1;
                    leased.push(LeasedTask {
                        task_id: id,
                        queue: task.queue,
                        envelope: task.envelope.clone(),
                        receive_count: task.receive_count,
                    });
                }
            }

            Ok(leased)
        }

        async fn ack(&self, task_id: TaskId) -> Result<()> {
            match self.tasks.lock().await.remove(&task_id) {
                Some(_) => Ok(()),
                None => Err(QueueError::UnknownTask(task_id)),
            }
        }

        async fn nack(&self, task_id: TaskId, delay: Duration) -> Result<()> {
            let visible_at = self.clock.now_utc()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| QueueError::broker(e.to_string()))?;

            match self.tasks.lock().await.get_mut(&task_id) {
                Some(task) => {
                    task.visible_at = visible_at;
                    Ok(())
                },
                None => Err(QueueError::UnknownTask(task_id)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_core::TestClock;

    use super::{memory::InMemoryTaskQueue, *};
    use crate::envelope::{TaskPayload, WorkflowTask};

    fn envelope(clock: &TestClock) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskPayload::Workflow(WorkflowTask {
                workflow: "reindex".into(),
                input: serde_json::json!({}),
            }),
            clock.now_utc(),
        )
    }

    fn queue_with_clock() -> (InMemoryTaskQueue, TestClock) {
        let clock = TestClock::new();
        (InMemoryTaskQueue::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn leased_task_is_invisible_until_lease_expires() {
        let (queue, clock) = queue_with_clock();
        queue.enqueue(QueueName::Default, envelope(&clock)).await.unwrap();

        let first = queue.dequeue(QueueName::Default, 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        let second = queue.dequeue(QueueName::Default, 10, Duration::from_secs(30)).await.unwrap();
        assert!(second.is_empty());

        clock.advance(Duration::from_secs(31));

        let redelivered =
            queue.dequeue(QueueName::Default, 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test]
    async fn ack_removes_the_task() {
        let (queue, clock) = queue_with_clock();
        queue.enqueue(QueueName::Default, envelope(&clock)).await.unwrap();

        let leased = queue.dequeue(QueueName::Default, 1, Duration::from_secs(30)).await.unwrap();
        queue.ack(leased[0].task_id).await.unwrap();

        assert!(queue.is_empty().await);
        assert!(matches!(
            queue.ack(leased[0].task_id).await,
            Err(QueueError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn nack_makes_the_task_visible_after_the_delay() {
        let (queue, clock) = queue_with_clock();
        queue.enqueue(QueueName::Events, envelope(&clock)).await.unwrap();

        let leased = queue.dequeue(QueueName::Events, 1, Duration::from_secs(300)).await.unwrap();
        queue.nack(leased[0].task_id, Duration::from_secs(10)).await.unwrap();

        assert!(queue.dequeue(QueueName::Events, 1, Duration::from_secs(300)).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(11));

        let redelivered =
            queue.dequeue(QueueName::Events, 1, Duration::from_secs(300)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (queue, clock) = queue_with_clock();
        queue.enqueue(QueueName::Events, envelope(&clock)).await.unwrap();
        queue.enqueue(QueueName::Workflow, envelope(&clock)).await.unwrap();

        let events = queue.dequeue(QueueName::Events, 10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].queue, QueueName::Events);
        assert_eq!(queue.len_for(QueueName::Workflow).await, 1);
    }

    #[tokio::test]
    async fn dequeue_is_fifo_and_bounded() {
        let (queue, clock) = queue_with_clock();
        for _ in 0..3 {
            queue.enqueue(QueueName::Default, envelope(&clock)).await.unwrap();
            clock.advance(Duration::from_millis(1));
        }

        let leased = queue.dequeue(QueueName::Default, 2, Duration::from_secs(30)).await.unwrap();
        assert_eq!(leased.len(), 2);
        assert_eq!(queue.len().await, 3);
    }
}
