//! Job Worker
//!
//! Claims and executes background jobs until SIGTERM/SIGINT, then drains.
//! Any number of instances may run against the same database.

use std::sync::Arc;

use anyhow::{Context, Result};
use jobs_core::kernel::install_shutdown_handler;
use jobs_core::kernel::jobs::handlers::register_builtin_handlers;
use jobs_core::kernel::jobs::{JobRegistry, JobService, JobWorker, PostgresJobStore};
use jobs_core::kernel::scheduled_tasks::start_scheduler;
use jobs_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,jobs_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    // Database setup
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PostgresJobStore::new(pool.clone()));
    let service = JobService::with_config(store.clone(), config.service_config());

    let mut registry = JobRegistry::new();
    register_builtin_handlers(&mut registry, service.clone());
    tracing::info!(job_types = ?registry.registered_types(), "Handlers registered");

    let worker_config = config.worker_config();
    tracing::info!(
        worker_id = %worker_config.worker_id,
        concurrency = worker_config.concurrency,
        "Starting job worker"
    );

    let mut scheduler = start_scheduler(service, &config.job_cleanup_cron).await?;

    let shutdown = install_shutdown_handler()?;
    let worker = JobWorker::with_config(store, Arc::new(registry), worker_config);
    let result = worker.run(shutdown).await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Scheduler shutdown failed");
    }
    pool.close().await;

    result
}
