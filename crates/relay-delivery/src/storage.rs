//! Storage abstraction for the delivery pipeline.
//!
//! Trait-based seam over the operations the publisher, tracker, and task
//! handler need. Production goes through `relay_core::storage::Storage`;
//! tests use the in-memory store in the `memory` module, which mirrors the
//! compare-and-swap claim semantics under a single lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_core::{
    error::Result,
    models::{
        ConfigId, DeliveryAttempt, DeliveryId, Event, EventDelivery, EventId, ProcessorConfig,
    },
};

/// Storage operations required by the delivery pipeline.
#[async_trait]
pub trait DeliveryStore: Send + Sync + 'static {
    /// Finds active configs subscribed to the given event.
    async fn find_matching_configs(&self, event: &Event) -> Result<Vec<ProcessorConfig>>;

    /// Fetches a config by ID.
    async fn find_config(&self, id: ConfigId) -> Result<ProcessorConfig>;

    /// Idempotently creates a delivery for an (event, config) pair.
    ///
    /// Returns the delivery ID and whether this call created it.
    async fn create_or_fetch_delivery(&self, delivery: &EventDelivery)
        -> Result<(DeliveryId, bool)>;

    /// Attempts the compare-and-swap transition into `in_flight`.
    ///
    /// Returns the claimed row, or `None` when the delivery is not
    /// claimable (already in flight, terminal, or not yet eligible).
    async fn try_claim(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<EventDelivery>>;

    /// Appends one attempt to the audit trail.
    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()>;

    /// Transitions an in-flight delivery to `succeeded`.
    async fn mark_succeeded(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Transitions an in-flight delivery to `failed_retryable` with its
    /// next eligibility time.
    async fn schedule_retry(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Transitions a non-terminal delivery to `exhausted`.
    async fn mark_exhausted(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Returns in-flight deliveries last touched before `cutoff` to
    /// `pending`.
    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventDelivery>>;

    /// Fetches a delivery by ID.
    async fn find_delivery(&self, id: DeliveryId) -> Result<EventDelivery>;

    /// Fetches all deliveries created for one event.
    async fn find_deliveries_for_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>>;

    /// Fetches the attempt history of a delivery, oldest first.
    async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>>;
}

/// Production store backed by PostgreSQL repositories.
pub struct PostgresDeliveryStore {
    storage: Arc<relay_core::storage::Storage>,
}

impl PostgresDeliveryStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<relay_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn find_matching_configs(&self, event: &Event) -> Result<Vec<ProcessorConfig>> {
        self.storage
            .processor_configs
            .find_active_matching(event.client_id, event.entity_type, event.event_type)
            .await
    }

    async fn find_config(&self, id: ConfigId) -> Result<ProcessorConfig> {
        self.storage.processor_configs.find_by_id(id).await
    }

    async fn create_or_fetch_delivery(
        &self,
        delivery: &EventDelivery,
    ) -> Result<(DeliveryId, bool)> {
        self.storage.event_deliveries.create_or_fetch(delivery).await
    }

    async fn try_claim(&self, id: DeliveryId, now: DateTime<Utc>) -> Result<Option<EventDelivery>> {
        self.storage.event_deliveries.try_mark_in_flight(id, now).await
    }

    async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
        self.storage.delivery_attempts.create(attempt).await.map(|_| ())
    }

    async fn mark_succeeded(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.storage.event_deliveries.mark_succeeded(id, attempt_count, now).await
    }

    async fn schedule_retry(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.storage
            .event_deliveries
            .mark_retry_scheduled(id, attempt_count, next_eligible_at, now)
            .await
    }

    async fn mark_exhausted(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.storage.event_deliveries.mark_exhausted(id, attempt_count, now).await
    }

    async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventDelivery>> {
        self.storage.event_deliveries.reclaim_stuck(cutoff).await
    }

    async fn find_delivery(&self, id: DeliveryId) -> Result<EventDelivery> {
        self.storage.event_deliveries.find_by_id(id).await
    }

    async fn find_deliveries_for_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>> {
        self.storage.event_deliveries.find_by_event(event_id).await
    }

    async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        self.storage.delivery_attempts.find_by_delivery(delivery_id).await
    }
}

/// In-memory store for deterministic tests.
pub mod memory {
    use std::collections::HashMap;

    use relay_core::{CoreError, DeliveryStatus};
    use tokio::sync::RwLock;

    use super::*;

    /// Deterministic in-process store mirroring the database semantics,
    /// including the conditional in-flight claim and the (event, config)
    /// uniqueness rule.
    #[derive(Default)]
    pub struct InMemoryDeliveryStore {
        configs: RwLock<Vec<ProcessorConfig>>,
        deliveries: RwLock<HashMap<DeliveryId, EventDelivery>>,
        attempts: RwLock<Vec<DeliveryAttempt>>,
    }

    impl InMemoryDeliveryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds a config to the store.
        pub async fn add_config(&self, config: ProcessorConfig) {
            self.configs.write().await.push(config);
        }

        /// Number of stored deliveries.
        pub async fn delivery_count(&self) -> usize {
            self.deliveries.read().await.len()
        }

        /// Number of recorded attempts across all deliveries.
        pub async fn attempt_count(&self) -> usize {
            self.attempts.read().await.len()
        }
    }

    #[async_trait]
    impl DeliveryStore for InMemoryDeliveryStore {
        async fn find_matching_configs(&self, event: &Event) -> Result<Vec<ProcessorConfig>> {
            Ok(self
                .configs
                .read()
                .await
                .iter()
                .filter(|c| c.client_id == event.client_id && c.matches(event))
                .cloned()
                .collect())
        }

        async fn find_config(&self, id: ConfigId) -> Result<ProcessorConfig> {
            self.configs
                .read()
                .await
                .iter()
                .find(|c| c.id == id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("config {id}")))
        }

        async fn create_or_fetch_delivery(
            &self,
            delivery: &EventDelivery,
        ) -> Result<(DeliveryId, bool)> {
            let mut deliveries = self.deliveries.write().await;

            if let Some(existing) = deliveries
                .values()
                .find(|d| d.event_id == delivery.event_id && d.config_id == delivery.config_id)
            {
                return Ok((existing.id, false));
            }

            deliveries.insert(delivery.id, delivery.clone());
            Ok((delivery.id, true))
        }

        async fn try_claim(
            &self,
            id: DeliveryId,
            now: DateTime<Utc>,
        ) -> Result<Option<EventDelivery>> {
            let mut deliveries = self.deliveries.write().await;
            let Some(delivery) = deliveries.get_mut(&id) else {
                return Ok(None);
            };

            let claimable = matches!(
                delivery.status,
                DeliveryStatus::Pending | DeliveryStatus::FailedRetryable
            ) && delivery.next_eligible_at.map_or(true, |at| at <= now);

            if !claimable {
                return Ok(None);
            }

            delivery.status = DeliveryStatus::InFlight;
            delivery.updated_at = now;
            Ok(Some(delivery.clone()))
        }

        async fn record_attempt(&self, attempt: &DeliveryAttempt) -> Result<()> {
            self.attempts.write().await.push(attempt.clone());
            Ok(())
        }

        async fn mark_succeeded(
            &self,
            id: DeliveryId,
            attempt_count: i32,
            now: DateTime<Utc>,
        ) -> Result<()> {
            let mut deliveries = self.deliveries.write().await;
            let Some(delivery) = deliveries.get_mut(&id) else {
                return Err(CoreError::NotFound(format!("delivery {id}")));
            };
            if delivery.status != DeliveryStatus::InFlight {
                return Err(CoreError::ConstraintViolation(format!(
                    "delivery {id} is no longer in_flight; succeeded transition lost"
                )));
            }
            delivery.status = DeliveryStatus::Succeeded;
            delivery.attempt_count = attempt_count;
            delivery.next_eligible_at = None;
            delivery.updated_at = now;
            Ok(())
        }

        async fn schedule_retry(
            &self,
            id: DeliveryId,
            attempt_count: i32,
            next_eligible_at: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<()> {
            let mut deliveries = self.deliveries.write().await;
            let Some(delivery) = deliveries.get_mut(&id) else {
                return Err(CoreError::NotFound(format!("delivery {id}")));
            };
            if delivery.status != DeliveryStatus::InFlight {
                return Err(CoreError::ConstraintViolation(format!(
                    "delivery {id} is no longer in_flight; retry transition lost"
                )));
            }
            delivery.status = DeliveryStatus::FailedRetryable;
            delivery.attempt_count = attempt_count;
            delivery.next_eligible_at = Some(next_eligible_at);
            delivery.updated_at = now;
            Ok(())
        }

        async fn mark_exhausted(
            &self,
            id: DeliveryId,
            attempt_count: i32,
            now: DateTime<Utc>,
        ) -> Result<()> {
            let mut deliveries = self.deliveries.write().await;
            if let Some(delivery) = deliveries.get_mut(&id) {
                if !delivery.status.is_terminal() {
                    delivery.status = DeliveryStatus::Exhausted;
                    delivery.attempt_count = attempt_count;
                    delivery.next_eligible_at = None;
                    delivery.updated_at = now;
                }
            }
            Ok(())
        }

        async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventDelivery>> {
            let mut deliveries = self.deliveries.write().await;
            let mut reclaimed = Vec::new();

            for delivery in deliveries.values_mut() {
                if delivery.status == DeliveryStatus::InFlight && delivery.updated_at < cutoff {
                    delivery.status = DeliveryStatus::Pending;
                    reclaimed.push(delivery.clone());
                }
            }

            Ok(reclaimed)
        }

        async fn find_delivery(&self, id: DeliveryId) -> Result<EventDelivery> {
            self.deliveries
                .read()
                .await
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))
        }

        async fn find_deliveries_for_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>> {
            let mut deliveries: Vec<EventDelivery> = self
                .deliveries
                .read()
                .await
                .values()
                .filter(|d| d.event_id == event_id)
                .cloned()
                .collect();
            deliveries.sort_by_key(|d| d.created_at);
            Ok(deliveries)
        }

        async fn find_attempts(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
            let mut attempts: Vec<DeliveryAttempt> = self
                .attempts
                .read()
                .await
                .iter()
                .filter(|a| a.delivery_id == delivery_id)
                .cloned()
                .collect();
            attempts.sort_by_key(|a| a.attempt_number);
            Ok(attempts)
        }
    }
}
