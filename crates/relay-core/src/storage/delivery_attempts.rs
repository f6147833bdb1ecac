//! Repository for the append-only delivery attempt audit trail.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttempt, DeliveryId},
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

    /// Records one attempt. Attempts are never updated or deleted.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_attempts (
                id, delivery_id, attempt_number, started_at, finished_at,
                outcome, error_detail, latency_ms
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(attempt.attempt_number)
        .bind(attempt.started_at)
        .bind(attempt.finished_at)
        .bind(attempt.outcome)
        .bind(&attempt.error_detail)
        .bind(attempt.latency_ms)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Fetches the attempt history for a delivery, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r#"
            SELECT id, delivery_id, attempt_number, started_at, finished_at,
                   outcome, error_detail, latency_ms
            FROM delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }
}
