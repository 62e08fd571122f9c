// Bootstrap utilities for binary initialization

use crate::config::Settings;
use crate::db::{DbPool, JobRepository};
use crate::job::Schedulable;
use crate::queue::{JobPublisher, NatsClient, NatsJobPublisher};
use crate::scheduler::SchedulerEngine;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Initialize the database pool and apply pending migrations when enabled
///
/// # Errors
/// Returns error if the pool cannot connect or a migration fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    if settings.database.run_migrations {
        db_pool
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Connect to NATS, ensure the job stream exists and wrap it in a publisher
///
/// # Errors
/// Returns error if the connection or the stream setup fails
#[tracing::instrument(skip(settings))]
pub async fn init_job_publisher(settings: &Settings) -> Result<Arc<dyn JobPublisher>> {
    info!("Initializing job publisher");

    let nats_client = NatsClient::connect(settings.nats.clone())
        .await
        .context("Failed to initialize NATS client")?;

    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize NATS stream")?;

    nats_client
        .health_check()
        .await
        .context("NATS stream is not reachable")?;

    info!("Job publisher initialized");
    Ok(Arc::new(NatsJobPublisher::new(nats_client)))
}

/// Build an engine for `J` on top of the PostgreSQL job store
///
/// # Errors
/// Returns error if the engine settings are rejected
pub fn build_engine<J: Schedulable>(
    settings: &Settings,
    db_pool: DbPool,
    publisher: Arc<dyn JobPublisher>,
) -> Result<SchedulerEngine<J>> {
    let store = Arc::new(JobRepository::new(db_pool));
    let engine = SchedulerEngine::new(store, publisher, settings.engine.to_engine_config())
        .context("Failed to create scheduler engine")?;

    info!(kind = J::KIND, instance_id = %engine.instance_id(), "Scheduler engine built");
    Ok(engine)
}
