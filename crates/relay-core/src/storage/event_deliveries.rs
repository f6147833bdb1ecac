//! Repository for event delivery state transitions.
//!
//! Every status change is expressed as a guarded `UPDATE ... WHERE status
//! IN (...)` compare-and-swap so concurrent workers can race safely. The
//! row count tells the caller whether its transition won.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{ConfigId, DeliveryId, EventDelivery, EventId},
};

pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Idempotently creates a delivery for an (event, config) pair.
    ///
    /// The UNIQUE (event_id, config_id) constraint makes repeated publishes
    /// of the same event converge on one row. Returns the delivery ID and
    /// whether this call inserted it.
    ///
    /// # Errors
    ///
    /// Returns error if insert or the fallback lookup fails.
    pub async fn create_or_fetch(&self, delivery: &EventDelivery) -> Result<(DeliveryId, bool)> {
        let inserted: Option<DeliveryId> = sqlx::query_scalar(
            r#"
            INSERT INTO event_deliveries (
                id, event_id, config_id, status, attempt_count,
                next_eligible_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id, config_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.event_id)
        .bind(delivery.config_id)
        .bind(delivery.status)
        .bind(delivery.attempt_count)
        .bind(delivery.next_eligible_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_optional(&*self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok((id, true));
        }

        let existing: DeliveryId = sqlx::query_scalar(
            "SELECT id FROM event_deliveries WHERE event_id = $1 AND config_id = $2",
        )
        .bind(delivery.event_id)
        .bind(delivery.config_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok((existing, false))
    }

    /// Attempts to move a delivery into `in_flight`.
    ///
    /// This is the in-flight gate: the conditional update succeeds only
    /// when the row is claimable (`pending`, or `failed_retryable` past its
    /// `next_eligible_at`). A losing racer gets `None` and must not attempt
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn try_mark_in_flight(
        &self,
        id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Option<EventDelivery>> {
        let claimed = sqlx::query_as::<_, EventDelivery>(
            r#"
            UPDATE event_deliveries
            SET status = 'in_flight', updated_at = $2
            WHERE id = $1
              AND status IN ('pending', 'failed_retryable')
              AND (next_eligible_at IS NULL OR next_eligible_at <= $2)
            RETURNING id, event_id, config_id, status, attempt_count,
                      next_eligible_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(claimed)
    }

    /// Marks an in-flight delivery as succeeded. Terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails, or `ConstraintViolation` when the
    /// row is no longer `in_flight` (the reclaim sweep beat this writer)
    /// and the transition was lost.
    pub async fn mark_succeeded(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'succeeded', attempt_count = $2,
                next_eligible_at = NULL, updated_at = $3
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ConstraintViolation(format!(
                "delivery {id} is no longer in_flight; succeeded transition lost"
            )));
        }

        Ok(())
    }

    /// Schedules an in-flight delivery for retry.
    ///
    /// Releases the gate by moving to `failed_retryable` with the next
    /// eligibility time; a later claim re-enters `in_flight` through
    /// [`Repository::try_mark_in_flight`].
    ///
    /// # Errors
    ///
    /// Returns error if the update fails, or `ConstraintViolation` when the
    /// row is no longer `in_flight` and the transition was lost.
    pub async fn mark_retry_scheduled(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        next_eligible_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'failed_retryable', attempt_count = $2,
                next_eligible_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'in_flight'
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(next_eligible_at)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ConstraintViolation(format!(
                "delivery {id} is no longer in_flight; retry transition lost"
            )));
        }

        Ok(())
    }

    /// Marks a delivery as exhausted. Terminal.
    ///
    /// Reached when the retry budget is spent, a permanent failure occurs,
    /// or the publisher short-circuits a malformed target. The guard admits
    /// every non-terminal status because exhaustion can happen from
    /// `pending` (publish-time failures) as well as `in_flight`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_exhausted(
        &self,
        id: DeliveryId,
        attempt_count: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE event_deliveries
            SET status = 'exhausted', attempt_count = $2,
                next_eligible_at = NULL, updated_at = $3
            WHERE id = $1 AND status IN ('pending', 'in_flight', 'failed_retryable')
            "#,
        )
        .bind(id)
        .bind(attempt_count)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Returns stuck in-flight deliveries to `pending`.
    ///
    /// A delivery whose worker died mid-attempt stays `in_flight` forever
    /// without this sweep. Anything last touched before `cutoff` is assumed
    /// abandoned and made claimable again.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reclaim_stuck(&self, cutoff: DateTime<Utc>) -> Result<Vec<EventDelivery>> {
        let reclaimed = sqlx::query_as::<_, EventDelivery>(
            r#"
            UPDATE event_deliveries
            SET status = 'pending', updated_at = NOW()
            WHERE status = 'in_flight' AND updated_at < $1
            RETURNING id, event_id, config_id, status, attempt_count,
                      next_eligible_at, created_at, updated_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await?;

        Ok(reclaimed)
    }

    /// Fetches a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no delivery exists with this ID.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<EventDelivery> {
        let delivery = sqlx::query_as::<_, EventDelivery>(
            r#"
            SELECT id, event_id, config_id, status, attempt_count,
                   next_eligible_at, created_at, updated_at
            FROM event_deliveries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Fetches all deliveries created for one event.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event(&self, event_id: EventId) -> Result<Vec<EventDelivery>> {
        let deliveries = sqlx::query_as::<_, EventDelivery>(
            r#"
            SELECT id, event_id, config_id, status, attempt_count,
                   next_eligible_at, created_at, updated_at
            FROM event_deliveries
            WHERE event_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(event_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Fetches the delivery for an (event, config) pair, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_event_and_config(
        &self,
        event_id: EventId,
        config_id: ConfigId,
    ) -> Result<Option<EventDelivery>> {
        let delivery = sqlx::query_as::<_, EventDelivery>(
            r#"
            SELECT id, event_id, config_id, status, attempt_count,
                   next_eligible_at, created_at, updated_at
            FROM event_deliveries
            WHERE event_id = $1 AND config_id = $2
            "#,
        )
        .bind(event_id)
        .bind(config_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }
}
