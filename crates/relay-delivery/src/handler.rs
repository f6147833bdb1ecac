//! Task handler executing one delivery attempt per delivery task.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use relay_core::AttemptOutcome;
use relay_queue::{TaskEnvelope, TaskError, TaskHandler, TaskPayload};
use tracing::debug;

use crate::{
    client::DeliveryClient,
    tracking::{AttemptDisposition, ClaimMiss, DeliveryTracker},
};

/// How long to hold a task whose delivery is gated by another attempt.
///
/// Shorter than the reclaim grace period, so a task kept alive this way
/// outlives the sweep that frees a crashed holder's gate.
const GATE_RECHECK_DELAY: Duration = Duration::from_secs(60);

/// Handles `delivery` tasks: claim the gate, POST, record the outcome.
pub struct DeliveryTaskHandler {
    tracker: Arc<DeliveryTracker>,
    client: DeliveryClient,
}

impl DeliveryTaskHandler {
    /// Creates a handler over the given tracker and HTTP client.
    pub fn new(tracker: Arc<DeliveryTracker>, client: DeliveryClient) -> Self {
        Self { tracker, client }
    }
}

#[async_trait]
impl TaskHandler for DeliveryTaskHandler {
    async fn handle(&self, envelope: TaskEnvelope) -> Result<(), TaskError> {
        let TaskPayload::Delivery(task) = envelope.payload else {
            return Err(TaskError::permanent("delivery handler received non-delivery payload"));
        };

        let claimed = self
            .tracker
            .begin_attempt(task.delivery_id)
            .await
            .map_err(|e| TaskError::transient(e.to_string()))?;
        let Some(claimed) = claimed else {
            // The task is the only carrier of the event, so it may only be
            // dropped once the delivery is settled.
            let miss = self
                .tracker
                .classify_missed_claim(task.delivery_id)
                .await
                .map_err(|e| TaskError::transient(e.to_string()))?;
            return match miss {
                ClaimMiss::Settled => {
                    debug!(delivery_id = %task.delivery_id, "delivery settled, dropping task");
                    Ok(())
                },
                ClaimMiss::Busy => Err(TaskError::retry_after(
                    "another attempt holds the in-flight gate",
                    GATE_RECHECK_DELAY,
                )),
                ClaimMiss::NotYetEligible(wait) => Err(TaskError::retry_after(
                    "delivery not yet eligible for retry",
                    wait.max(Duration::from_secs(1)),
                )),
            };
        };

        let (outcome, error_detail) = match self
            .client
            .deliver(
                &claimed.config.target.url,
                &task.event,
                task.delivery_id,
                claimed.attempt_number(),
            )
            .await
        {
            Ok(_) => (AttemptOutcome::Success, None),
            Err(error) => (error.outcome(), Some(error.to_string())),
        };

        let disposition = self
            .tracker
            .complete_attempt(&claimed, outcome, error_detail.clone())
            .await
            .map_err(|e| TaskError::transient(e.to_string()))?;

        match disposition {
            // Terminal outcomes settle the domain state; the broker task
            // is done either way.
            AttemptDisposition::Done | AttemptDisposition::Exhausted => Ok(()),
            AttemptDisposition::RetryAfter(delay) => Err(TaskError::retry_after(
                error_detail.unwrap_or_else(|| "delivery attempt failed".into()),
                delay,
            )),
        }
    }
}
