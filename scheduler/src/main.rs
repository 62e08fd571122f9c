// Scheduler binary entry point

use anyhow::Context;
use common::bootstrap::{build_engine, init_database_pool, init_job_publisher};
use common::config::Settings;
use common::errors::SchedulerError;
use common::job::RelayJob;
use common::scheduler::Scheduler;
use common::telemetry;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Scheduler terminated with error");
            eprintln!("scheduler: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    // Load configuration before logging so the level can come from it
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    telemetry::install_panic_hook();

    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!(
        nats_url = %settings.nats.url,
        stream_name = %settings.nats.stream_name,
        max_in_flight_jobs = settings.engine.max_in_flight_jobs,
        max_retry = settings.engine.max_retry,
        "Configuration loaded"
    );

    telemetry::init_metrics(settings.observability.metrics_port)?;

    let db_pool = init_database_pool(&settings).await?;
    let publisher = init_job_publisher(&settings).await?;
    let engine = build_engine::<RelayJob>(&settings, db_pool.clone(), publisher)?;

    let engine_for_shutdown = engine.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
        }
        if let Err(e) = engine_for_shutdown.stop().await {
            error!(error = %e, "Error during scheduler shutdown");
        }
    });

    info!("Starting scheduler control loops");
    let result = engine.start().await;

    db_pool.close().await;
    telemetry::shutdown_tracer();

    match result {
        Ok(()) => {
            info!("Scheduler stopped");
            Ok(())
        }
        Err(e @ SchedulerError::LoopExhausted { .. }) => {
            Err(anyhow::Error::new(e).context("A control loop could not be kept alive"))
        }
        Err(e) => Err(e.into()),
    }
}
