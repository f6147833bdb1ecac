//! Multi-queue worker pool with supervision and graceful shutdown.
//!
//! Spawns an independent set of workers per queue so a backlog of slow
//! workflow tasks cannot starve event deliveries. Handlers run inside a
//! spawned task, so a panicking handler is converted into a transient
//! failure instead of taking its worker down.

use std::{sync::Arc, time::Duration};

use relay_core::{Clock, QueueName};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{QueueError, Result},
    queue::{LeasedTask, TaskQueue},
    registry::{TaskErrorKind, TaskRegistry},
};

/// Per-queue worker configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue to consume.
    pub name: QueueName,
    /// Number of concurrent workers on this queue.
    pub concurrency: usize,
    /// Maximum broker deliveries of one task before it is abandoned.
    ///
    /// This counts `receive_count` and is independent of any domain retry
    /// budget carried in the task's payload.
    pub redelivery_ceiling: i32,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Queues to consume and their concurrency limits.
    pub queues: Vec<QueueConfig>,
    /// Maximum tasks leased per poll.
    pub batch_size: usize,
    /// How long a worker sleeps when its queue is empty.
    pub poll_interval: Duration,
    /// Broker lease duration for dequeued tasks.
    pub visibility_timeout: Duration,
    /// Maximum wall-clock time for one handler invocation.
    pub handler_timeout: Duration,
    /// Maximum time to wait for workers during graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                QueueConfig { name: QueueName::Events, concurrency: 8, redelivery_ceiling: 5 },
                QueueConfig { name: QueueName::Workflow, concurrency: 4, redelivery_ceiling: 5 },
                QueueConfig { name: QueueName::Default, concurrency: 2, redelivery_ceiling: 5 },
            ],
            batch_size: 5,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of pool activity for monitoring.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Tasks leased and dispatched since startup.
    pub tasks_processed: u64,
    /// Tasks whose handler completed successfully.
    pub tasks_succeeded: u64,
    /// Tasks whose handler failed (transient or permanent).
    pub tasks_failed: u64,
    /// Tasks dropped after exceeding their queue's redelivery ceiling,
    /// plus undecodable or unregistered tasks.
    pub tasks_abandoned: u64,
}

/// Worker pool consuming broker queues through a handler registry.
pub struct WorkerPool {
    broker: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<PoolStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Creates a pool. Call [`WorkerPool::spawn_workers`] to start it.
    pub fn new(
        broker: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            registry,
            config,
            clock,
            stats: Arc::new(RwLock::new(PoolStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns all configured workers and begins processing.
    ///
    /// Returns immediately after spawning; workers run until shutdown.
    pub async fn spawn_workers(&mut self) {
        let total: usize = self.config.queues.iter().map(|q| q.concurrency).sum();
        info!(worker_count = total, queues = self.config.queues.len(), "starting worker pool");

        self.stats.write().await.active_workers = total;

        for queue_config in self.config.queues.clone() {
            for index in 0..queue_config.concurrency {
                let worker = TaskWorker {
                    id: index,
                    queue: queue_config.name,
                    redelivery_ceiling: queue_config.redelivery_ceiling,
                    broker: self.broker.clone(),
                    registry: self.registry.clone(),
                    batch_size: self.config.batch_size,
                    poll_interval: self.config.poll_interval,
                    visibility_timeout: self.config.visibility_timeout,
                    handler_timeout: self.config.handler_timeout,
                    clock: self.clock.clone(),
                    stats: self.stats.clone(),
                    cancellation_token: self.cancellation_token.clone(),
                };

                self.worker_handles.push(tokio::spawn(async move { worker.run().await }));
            }
        }
    }

    /// Returns current pool statistics.
    pub async fn stats(&self) -> PoolStats {
        self.stats.read().await.clone()
    }

    /// Checks whether any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }

    /// Signals cancellation and waits for all workers to finish.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ShutdownTimeout` if workers do not stop within
    /// the configured shutdown timeout.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let join_all = async {
            for (worker_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                }
            }
            stats.write().await.active_workers = 0;
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(QueueError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active,
                "worker pool dropped with active workers, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

struct TaskWorker {
    id: usize,
    queue: QueueName,
    redelivery_ceiling: i32,
    broker: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    batch_size: usize,
    poll_interval: Duration,
    visibility_timeout: Duration,
    handler_timeout: Duration,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<PoolStats>>,
    cancellation_token: CancellationToken,
}

impl TaskWorker {
    async fn run(&self) {
        info!(worker_id = self.id, queue = %self.queue, "worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.process_batch().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(_) => {},
                Err(error) => {
                    error!(
                        worker_id = self.id,
                        queue = %self.queue,
                        error = %error,
                        "worker batch failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!(worker_id = self.id, queue = %self.queue, "worker stopped");
    }

    async fn process_batch(&self) -> Result<usize> {
        let tasks =
            self.broker.dequeue(self.queue, self.batch_size, self.visibility_timeout).await?;
        let count = tasks.len();

        for task in tasks {
            if self.cancellation_token.is_cancelled() {
                break;
            }
            self.process_task(task).await;
        }

        Ok(count)
    }

    async fn process_task(&self, task: LeasedTask) {
        self.stats.write().await.tasks_processed += 1;

        let envelope = match task.decode() {
            Ok(envelope) => envelope,
            Err(error) => {
                // Undecodable tasks would redeliver forever; drop them
                // loudly instead.
                error!(
                    task_id = %task.task_id,
                    queue = %self.queue,
                    error = %error,
                    "dropping undecodable task"
                );
                self.stats.write().await.tasks_abandoned += 1;
                self.finalize(task.task_id, true, Duration::ZERO).await;
                return;
            },
        };

        let kind = envelope.kind();
        let Some((handler, redelivery)) = self.registry.resolve(kind) else {
            error!(
                task_id = %task.task_id,
                queue = %self.queue,
                kind = %kind,
                "dropping task with no registered handler"
            );
            self.stats.write().await.tasks_abandoned += 1;
            self.finalize(task.task_id, true, Duration::ZERO).await;
            return;
        };

        // Spawned so a panicking handler surfaces as a JoinError here
        // rather than unwinding through the worker loop.
        let handler_run = tokio::spawn(async move { handler.handle(envelope).await });
        let abort_handle = handler_run.abort_handle();
        let outcome = match tokio::time::timeout(self.handler_timeout, handler_run).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(crate::registry::TaskError::transient(format!(
                "handler panicked: {join_error}"
            ))),
            Err(_) => {
                // The timed-out invocation must actually stop; a detached
                // run would race its own redelivery.
                abort_handle.abort();
                Err(crate::registry::TaskError::transient(format!(
                    "handler timed out after {:?}",
                    self.handler_timeout
                )))
            },
        };

        match outcome {
            Ok(()) => {
                debug!(task_id = %task.task_id, kind = %kind, "task completed");
                self.stats.write().await.tasks_succeeded += 1;
                self.finalize(task.task_id, true, Duration::ZERO).await;
            },
            Err(task_error) => match task_error.kind {
                TaskErrorKind::Permanent => {
                    error!(
                        task_id = %task.task_id,
                        kind = %kind,
                        error = %task_error,
                        "task failed permanently"
                    );
                    self.stats.write().await.tasks_failed += 1;
                    self.finalize(task.task_id, true, Duration::ZERO).await;
                },
                TaskErrorKind::Transient { retry_after } => {
                    if task.receive_count >= self.redelivery_ceiling {
                        error!(
                            task_id = %task.task_id,
                            kind = %kind,
                            receive_count = task.receive_count,
                            error = %task_error,
                            "task exceeded redelivery ceiling, abandoning"
                        );
                        let mut stats = self.stats.write().await;
                        stats.tasks_failed += 1;
                        stats.tasks_abandoned += 1;
                        drop(stats);
                        self.finalize(task.task_id, true, Duration::ZERO).await;
                    } else {
                        let delay =
                            retry_after.unwrap_or_else(|| redelivery.delay(task.receive_count));
                        warn!(
                            task_id = %task.task_id,
                            kind = %kind,
                            receive_count = task.receive_count,
                            delay_ms = delay.as_millis() as u64,
                            error = %task_error,
                            "task failed, scheduling redelivery"
                        );
                        self.stats.write().await.tasks_failed += 1;
                        self.finalize(task.task_id, false, delay).await;
                    }
                },
            },
        }
    }

    /// Acks or nacks, logging broker errors instead of propagating them.
    /// A lost ack only means one extra redelivery under at-least-once.
    async fn finalize(&self, task_id: relay_core::TaskId, ack: bool, delay: Duration) {
        let result = if ack {
            self.broker.ack(task_id).await
        } else {
            self.broker.nack(task_id, delay).await
        };

        if let Err(error) = result {
            warn!(task_id = %task_id, error = %error, "task finalization failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_covers_all_queues() {
        let config = PoolConfig::default();
        let names: Vec<QueueName> = config.queues.iter().map(|q| q.name).collect();

        for queue in QueueName::ALL {
            assert!(names.contains(&queue), "missing queue {queue}");
        }
    }

    #[test]
    fn event_queue_has_the_highest_concurrency() {
        let config = PoolConfig::default();
        let concurrency = |name: QueueName| {
            config.queues.iter().find(|q| q.name == name).map(|q| q.concurrency).unwrap_or(0)
        };

        assert!(concurrency(QueueName::Events) > concurrency(QueueName::Workflow));
        assert!(concurrency(QueueName::Workflow) > concurrency(QueueName::Default));
    }
}
