//! Database access layer implementing the repository pattern.
//!
//! The repository layer translates between domain models and the database
//! schema. All database operations go through these repositories; direct
//! SQL outside this module is forbidden to keep status transitions
//! auditable in one place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_attempts;
pub mod event_deliveries;
pub mod processor_configs;

use crate::error::Result;

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    /// Repository for processor config lookups.
    pub processor_configs: Arc<processor_configs::Repository>,

    /// Repository for event delivery state transitions.
    pub event_deliveries: Arc<event_deliveries::Repository>,

    /// Repository for the append-only attempt audit trail.
    pub delivery_attempts: Arc<delivery_attempts::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    ///
    /// All repositories share the same pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            processor_configs: Arc::new(processor_configs::Repository::new(pool.clone())),
            event_deliveries: Arc::new(event_deliveries::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.event_deliveries.pool()).await?;

        Ok(())
    }
}
