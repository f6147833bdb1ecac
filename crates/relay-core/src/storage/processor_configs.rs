//! Repository for processor config database operations.
//!
//! Configs are authored by the CRUD layer; this subsystem reads them during
//! event fan-out and delivery. Writes exist for bootstrap and tests.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{ClientId, ConfigId, EntityType, EventType, ProcessorConfig},
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

    /// Finds active configs subscribed to the given event shape.
    ///
    /// Matches on tenant and entity type, with the event type filter
    /// satisfied by an exact match or a NULL (wildcard) filter. Inactive
    /// configs are excluded here rather than post-filtered.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_matching(
        &self,
        client_id: ClientId,
        entity_type: EntityType,
        event_type: EventType,
    ) -> Result<Vec<ProcessorConfig>> {
        let configs = sqlx::query_as::<_, ProcessorConfig>(
            r#"
            SELECT id, client_id, entity_type, event_type, queue, url,
                   active, max_attempts, backoff, created_at, updated_at
            FROM processor_configs
            WHERE client_id = $1
              AND entity_type = $2
              AND (event_type IS NULL OR event_type = $3)
              AND active = TRUE
            ORDER BY created_at ASC
            "#,
        )
        .bind(client_id)
        .bind(entity_type)
        .bind(event_type)
        .fetch_all(&*self.pool)
        .await?;

        Ok(configs)
    }

    /// Fetches a config by ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no config exists with this ID.
    pub async fn find_by_id(&self, id: ConfigId) -> Result<ProcessorConfig> {
        let config = sqlx::query_as::<_, ProcessorConfig>(
            r#"
            SELECT id, client_id, entity_type, event_type, queue, url,
                   active, max_attempts, backoff, created_at, updated_at
            FROM processor_configs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(config)
    }

    /// Inserts a config.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, config: &ProcessorConfig) -> Result<ConfigId> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO processor_configs (
                id, client_id, entity_type, event_type, queue, url,
                active, max_attempts, backoff, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(config.id)
        .bind(config.client_id)
        .bind(config.entity_type)
        .bind(config.event_type)
        .bind(config.target.queue)
        .bind(&config.target.url)
        .bind(config.active)
        .bind(config.max_attempts)
        .bind(sqlx::types::Json(&config.backoff))
        .bind(config.created_at)
        .bind(config.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }
}
