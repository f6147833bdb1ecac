//! Relay event delivery service.
//!
//! Main entry point for the relay worker daemon. Initializes the database,
//! task queue, handler registry, and worker pool, and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_core::{storage::Storage, Clock, RealClock};
use relay_delivery::{
    DeliveryClient, DeliveryTaskHandler, DeliveryTracker, LoggingWorkflowRunner,
    PostgresDeliveryStore, WorkflowTaskHandler,
};
use relay_queue::{PgTaskQueue, TaskKind, TaskQueue, TaskRegistry, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("starting relay event delivery service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let storage = Arc::new(Storage::new(db_pool.clone()));
    let store = Arc::new(PostgresDeliveryStore::new(storage));
    let broker: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(db_pool.clone(), clock.clone()));
    let tracker = Arc::new(DeliveryTracker::new(store, clock.clone()));

    let registry = Arc::new(
        TaskRegistry::new()
            .with_handler(
                TaskKind::Delivery,
                Arc::new(DeliveryTaskHandler::new(
                    tracker.clone(),
                    DeliveryClient::new(config.to_client_config())?,
                )),
            )
            .with_handler(
                TaskKind::Workflow,
                Arc::new(WorkflowTaskHandler::new(Arc::new(LoggingWorkflowRunner))),
            ),
    );

    let mut pool = WorkerPool::new(broker, registry, config.to_pool_config(), clock);
    pool.spawn_workers().await;
    info!("worker pool started");

    let reclaim_handle = tokio::spawn(reclaim_sweep(
        tracker,
        Duration::from_secs(config.reclaim_grace_seconds),
        Duration::from_secs(config.reclaim_interval_seconds),
    ));

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    reclaim_handle.abort();

    if let Err(e) = pool.shutdown_graceful().await {
        error!(error = %e, "worker pool did not shut down cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("relay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with bounded retries.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the schema exists. Statements are idempotent so restarts are safe.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id UUID PRIMARY KEY,
            queue TEXT NOT NULL,
            envelope JSONB NOT NULL,
            enqueued_at TIMESTAMPTZ NOT NULL,
            visible_at TIMESTAMPTZ NOT NULL,
            receive_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create tasks table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processor_configs (
            id UUID PRIMARY KEY,
            client_id UUID NOT NULL,
            entity_type TEXT NOT NULL,
            event_type TEXT,
            queue TEXT NOT NULL,
            url TEXT NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            backoff JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create processor_configs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_deliveries (
            id UUID PRIMARY KEY,
            event_id UUID NOT NULL,
            config_id UUID NOT NULL REFERENCES processor_configs(id),
            status TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            next_eligible_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(event_id, config_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_deliveries table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS delivery_attempts (
            id UUID PRIMARY KEY,
            delivery_id UUID NOT NULL REFERENCES event_deliveries(id),
            attempt_number INTEGER NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ NOT NULL,
            outcome TEXT NOT NULL,
            error_detail TEXT,
            latency_ms BIGINT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create delivery_attempts table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_tasks_queue_visible
        ON tasks(queue, visible_at, enqueued_at)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create tasks queue index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_processor_configs_matching
        ON processor_configs(client_id, entity_type)
        WHERE active
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create processor_configs matching index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_deliveries_event
        ON event_deliveries(event_id)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_deliveries event index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_event_deliveries_stuck
        ON event_deliveries(updated_at)
        WHERE status = 'in_flight'
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_deliveries stuck index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_attempts_delivery
        ON delivery_attempts(delivery_id, attempt_number)
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create delivery_attempts index")?;

    Ok(())
}

/// Periodically returns deliveries stuck in flight to `pending` so they can
/// be claimed again after a worker crash.
async fn reclaim_sweep(tracker: Arc<DeliveryTracker>, grace: Duration, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        match tracker.reclaim_stuck(grace).await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                warn!(count = reclaimed.len(), "reclaimed stuck deliveries");
            },
            Ok(_) => {},
            Err(e) => {
                error!(error = %e, "stuck delivery sweep failed");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}
