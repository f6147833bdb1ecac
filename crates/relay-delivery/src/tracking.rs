//! Delivery tracking service: the authoritative `EventDelivery` state
//! machine.
//!
//! All status transitions go through this service. An attempt begins with
//! the compare-and-swap in-flight claim and ends with exactly one recorded
//! attempt plus one transition out of `in_flight`, on every exit path.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use relay_core::{
    AttemptOutcome, Clock, DeliveryAttempt, DeliveryId, EventDelivery, EventId, ProcessorConfig,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{backoff, error::Result, storage::DeliveryStore};

/// A delivery claimed for one attempt.
///
/// Holding this value means the caller won the in-flight gate and owes the
/// tracker exactly one `complete_attempt` call.
#[derive(Debug)]
pub struct ClaimedDelivery {
    /// The claimed delivery row, now `in_flight`.
    pub delivery: EventDelivery,
    /// Config governing target, retry budget, and backoff.
    pub config: ProcessorConfig,
    /// When the claim was taken; becomes the attempt's `started_at`.
    pub started_at: DateTime<Utc>,
}

impl ClaimedDelivery {
    /// 1-based number of the attempt this claim executes.
    pub fn attempt_number(&self) -> i32 {
        self.delivery.attempt_count + 1
    }
}

/// What the caller should do after an attempt completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDisposition {
    /// Delivery reached a terminal `succeeded` state.
    Done,
    /// A retry was scheduled; re-attempt after this delay.
    RetryAfter(Duration),
    /// Delivery reached a terminal `exhausted` state.
    Exhausted,
}

/// Why an in-flight claim was not granted.
///
/// The driving broker task must only be dropped for `Settled`: a delivery
/// carries its event in the task payload, so a dropped task for a live
/// delivery could never be reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMiss {
    /// Delivery is terminal; the task is obsolete and can be dropped.
    Settled,
    /// Another attempt currently holds the gate. Re-present the task later;
    /// if the holder crashed, the reclaim sweep will free the gate.
    Busy,
    /// Delivery is retryable but its `next_eligible_at` has not elapsed.
    NotYetEligible(Duration),
}

/// Coordinates delivery state transitions and the attempt audit trail.
pub struct DeliveryTracker {
    store: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
}

impl DeliveryTracker {
    /// Creates a tracker over the given store.
    pub fn new(store: Arc<dyn DeliveryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Attempts to claim the in-flight gate for a delivery.
    ///
    /// Returns `None` when the delivery is not claimable: another worker
    /// holds the gate, the delivery is terminal, or its `next_eligible_at`
    /// has not elapsed. Losing the claim is a benign no-op for the caller.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails or the delivery's config is gone.
    pub async fn begin_attempt(&self, delivery_id: DeliveryId) -> Result<Option<ClaimedDelivery>> {
        let now = self.clock.now_utc();

        // Resolve the config before taking the gate, so a config deleted
        // out from under the delivery cannot strand it in_flight.
        let delivery = self.store.find_delivery(delivery_id).await?;
        let config = self.store.find_config(delivery.config_id).await?;

        let Some(delivery) = self.store.try_claim(delivery_id, now).await? else {
            debug!(delivery_id = %delivery_id, "in-flight claim lost or delivery not eligible");
            return Ok(None);
        };

        Ok(Some(ClaimedDelivery { delivery, config, started_at: now }))
    }

    /// Explains why [`DeliveryTracker::begin_attempt`] returned `None`.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery does not exist or storage fails.
    pub async fn classify_missed_claim(&self, delivery_id: DeliveryId) -> Result<ClaimMiss> {
        let delivery = self.store.find_delivery(delivery_id).await?;

        if delivery.status.is_terminal() {
            return Ok(ClaimMiss::Settled);
        }

        if delivery.status == relay_core::DeliveryStatus::InFlight {
            return Ok(ClaimMiss::Busy);
        }

        let now = self.clock.now_utc();
        let wait = delivery
            .next_eligible_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Ok(ClaimMiss::NotYetEligible(wait))
    }

    /// Records the attempt and transitions the delivery out of `in_flight`.
    ///
    /// - `Success` settles the delivery as `succeeded`.
    /// - `PermanentFailure` exhausts it immediately, whatever the budget.
    /// - `TransientFailure` schedules a retry at `now + policy(attempt_count)`
    ///   while budget remains, and exhausts otherwise. `attempt_count`
    ///   never exceeds the config's `max_attempts`.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn complete_attempt(
        &self,
        claimed: &ClaimedDelivery,
        outcome: AttemptOutcome,
        error_detail: Option<String>,
    ) -> Result<AttemptDisposition> {
        let now = self.clock.now_utc();
        let delivery_id = claimed.delivery.id;
        let attempt_number = claimed.attempt_number();
        let latency_ms = (now - claimed.started_at).num_milliseconds().max(0);

        self.store
            .record_attempt(&DeliveryAttempt {
                id: Uuid::new_v4(),
                delivery_id,
                attempt_number,
                started_at: claimed.started_at,
                finished_at: now,
                outcome,
                error_detail: error_detail.clone(),
                latency_ms,
            })
            .await?;

        match outcome {
            AttemptOutcome::Success => {
                self.store.mark_succeeded(delivery_id, attempt_number, now).await?;
                info!(
                    event_id = %claimed.delivery.event_id,
                    delivery_id = %delivery_id,
                    attempt = attempt_number,
                    latency_ms,
                    "delivery succeeded"
                );
                Ok(AttemptDisposition::Done)
            },
            AttemptOutcome::PermanentFailure => {
                self.store.mark_exhausted(delivery_id, attempt_number, now).await?;
                warn!(
                    event_id = %claimed.delivery.event_id,
                    delivery_id = %delivery_id,
                    attempt = attempt_number,
                    error = error_detail.as_deref().unwrap_or(""),
                    "delivery failed permanently, exhausted"
                );
                Ok(AttemptDisposition::Exhausted)
            },
            AttemptOutcome::TransientFailure => {
                if attempt_number >= claimed.config.max_attempts {
                    self.store.mark_exhausted(delivery_id, attempt_number, now).await?;
                    warn!(
                        event_id = %claimed.delivery.event_id,
                        delivery_id = %delivery_id,
                        attempt = attempt_number,
                        max_attempts = claimed.config.max_attempts,
                        error = error_detail.as_deref().unwrap_or(""),
                        "retry budget spent, delivery exhausted"
                    );
                    Ok(AttemptDisposition::Exhausted)
                } else {
                    let delay = backoff::compute(&claimed.config.backoff, attempt_number);
                    let next_eligible_at = now
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX));
                    self.store
                        .schedule_retry(delivery_id, attempt_number, next_eligible_at, now)
                        .await?;
                    info!(
                        event_id = %claimed.delivery.event_id,
                        delivery_id = %delivery_id,
                        attempt = attempt_number,
                        delay_ms = delay.as_millis() as u64,
                        error = error_detail.as_deref().unwrap_or(""),
                        "transient failure, retry scheduled"
                    );
                    Ok(AttemptDisposition::RetryAfter(delay))
                }
            },
        }
    }

    /// Returns in-flight deliveries older than the grace period to
    /// `pending`.
    ///
    /// Covers workers that died holding the gate; the task lease expiry
    /// redelivers the broker task, and this sweep makes the domain row
    /// claimable again.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn reclaim_stuck(&self, grace: Duration) -> Result<Vec<EventDelivery>> {
        let cutoff = self.clock.now_utc()
            - chrono::Duration::from_std(grace)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(i64::MAX));

        let reclaimed = self.store.reclaim_stuck(cutoff).await?;

        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stuck in-flight deliveries");
        }

        Ok(reclaimed)
    }

    /// All deliveries created for one event.
    ///
    /// # Errors
    ///
    /// Returns error if storage fails.
    pub async fn deliveries_for_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>> {
        Ok(self.store.find_deliveries_for_event(event_id).await?)
    }

    /// One delivery with its full attempt history.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery does not exist or storage fails.
    pub async fn delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<(EventDelivery, Vec<DeliveryAttempt>)> {
        let delivery = self.store.find_delivery(delivery_id).await?;
        let attempts = self.store.find_attempts(delivery_id).await?;
        Ok((delivery, attempts))
    }
}
