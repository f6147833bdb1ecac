//! Event fan-out: config matching, idempotent delivery creation, task
//! enqueue.

use std::sync::Arc;

use relay_core::{AttemptOutcome, Clock, DeliveryAttempt, DeliveryId, Event, EventDelivery};
use relay_queue::{DeliveryTask, TaskPayload, TaskProducer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    storage::DeliveryStore,
};

/// Fans an event out to every matching processor config.
pub struct EventPublisher {
    store: Arc<dyn DeliveryStore>,
    producer: Arc<TaskProducer>,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Creates a publisher over the given store and producer.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        producer: Arc<TaskProducer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, producer, clock }
    }

    /// Publishes one event: one delivery per matching active config, one
    /// delivery task per newly created delivery.
    ///
    /// Publishing is idempotent per (event, config): re-publishing the
    /// same event converges on the existing deliveries without enqueueing
    /// duplicate tasks. Zero matching configs is a successful no-op.
    ///
    /// A config with an unparseable target URL gets its delivery exhausted
    /// immediately with one synthetic permanent attempt and consumes no
    /// broker slot.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if storage fails. A broker
    /// enqueue failure exhausts that delivery and is surfaced after the
    /// remaining configs have been processed; deliveries enqueued before
    /// the failure stay valid.
    pub async fn publish(&self, event: &Event) -> Result<Vec<DeliveryId>> {
        let configs = self.store.find_matching_configs(event).await?;

        if configs.is_empty() {
            debug!(event_id = %event.event_id, "no matching processor configs");
            return Ok(Vec::new());
        }

        let mut delivery_ids = Vec::with_capacity(configs.len());
        let mut first_enqueue_error = None;

        for config in configs {
            let now = self.clock.now_utc();
            let (delivery_id, created) = self
                .store
                .create_or_fetch_delivery(&EventDelivery::pending(event.event_id, config.id, now))
                .await?;
            delivery_ids.push(delivery_id);

            if !created {
                debug!(
                    event_id = %event.event_id,
                    config_id = %config.id,
                    delivery_id = %delivery_id,
                    "delivery already exists, skipping enqueue"
                );
                continue;
            }

            if let Err(parse_error) = reqwest::Url::parse(&config.target.url) {
                warn!(
                    event_id = %event.event_id,
                    config_id = %config.id,
                    delivery_id = %delivery_id,
                    url = %config.target.url,
                    error = %parse_error,
                    "malformed target URL, exhausting delivery"
                );
                self.exhaust_without_enqueue(
                    delivery_id,
                    format!("malformed target URL '{}': {parse_error}", config.target.url),
                )
                .await?;
                continue;
            }

            let payload = TaskPayload::Delivery(DeliveryTask {
                delivery_id,
                event: event.clone(),
            });

            match self.producer.enqueue(config.target.queue, payload).await {
                Ok(task_id) => {
                    info!(
                        event_id = %event.event_id,
                        config_id = %config.id,
                        delivery_id = %delivery_id,
                        task_id = %task_id,
                        queue = %config.target.queue,
                        "delivery task enqueued"
                    );
                },
                Err(enqueue_error) => {
                    warn!(
                        event_id = %event.event_id,
                        delivery_id = %delivery_id,
                        error = %enqueue_error,
                        "task enqueue failed, exhausting delivery"
                    );
                    self.exhaust_without_enqueue(
                        delivery_id,
                        format!("task enqueue failed: {enqueue_error}"),
                    )
                    .await?;
                    first_enqueue_error.get_or_insert(DeliveryError::database(format!(
                        "delivery {delivery_id} could not be enqueued: {enqueue_error}"
                    )));
                },
            }
        }

        match first_enqueue_error {
            Some(error) => Err(error),
            None => Ok(delivery_ids),
        }
    }

    /// Terminally fails a delivery that never reached the broker, leaving
    /// one synthetic permanent attempt in the audit trail.
    async fn exhaust_without_enqueue(
        &self,
        delivery_id: DeliveryId,
        error_detail: String,
    ) -> Result<()> {
        let now = self.clock.now_utc();

        self.store
            .record_attempt(&DeliveryAttempt {
                id: Uuid::new_v4(),
                delivery_id,
                attempt_number: 1,
                started_at: now,
                finished_at: now,
                outcome: AttemptOutcome::PermanentFailure,
                error_detail: Some(error_detail),
                latency_ms: 0,
            })
            .await?;
        self.store.mark_exhausted(delivery_id, 1, now).await?;

        Ok(())
    }
}
