//! Operator CLI for the job queue
//!
//! Every command prints a single JSON document to stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use jobs_core::common::{derive_dedupe_key, PageArgs};
use jobs_core::config::Config;
use jobs_core::kernel::jobs::{
    EnqueueRequest, JobFilter, JobScope, JobService, JobServiceConfig, JobStatus, PostgresJobStore,
};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "jobs_cli")]
#[command(about = "Inspect and administer the background job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a job
    Enqueue {
        job_type: String,
        /// JSON object
        #[arg(long, default_value = "{}")]
        payload: String,
        /// 1 (first) to 10 (last)
        #[arg(long)]
        priority: Option<i16>,
        /// RFC 3339 timestamp; defaults to now
        #[arg(long)]
        run_at: Option<DateTime<Utc>>,
        #[arg(long)]
        dedupe_key: Option<String>,
        /// Defaults to the system scope
        #[arg(long)]
        org: Option<Uuid>,
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Show one job
    Get {
        id: Uuid,
        #[arg(long)]
        org: Option<Uuid>,
    },

    /// List jobs, newest first
    List {
        /// Repeatable
        #[arg(long = "status")]
        statuses: Vec<JobStatus>,
        #[arg(long)]
        job_type: Option<String>,
        #[arg(long)]
        org: Option<Uuid>,
        #[arg(long)]
        user: Option<Uuid>,
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        offset: Option<i64>,
    },

    /// Queue statistics
    Stats {
        #[arg(long)]
        org: Option<Uuid>,
    },

    /// Requeue failed or deadlettered jobs
    Retry {
        #[arg(required = true)]
        ids: Vec<Uuid>,
        #[arg(long)]
        org: Option<Uuid>,
    },

    /// Cancel queued or running jobs
    Cancel {
        #[arg(required = true)]
        ids: Vec<Uuid>,
        #[arg(long)]
        org: Option<Uuid>,
    },

    /// Delete terminal jobs past the retention window
    Cleanup {
        /// Overrides JOB_CLEANUP_AFTER_DAYS
        #[arg(long)]
        older_than_days: Option<u64>,
    },

    /// Print the dedupe key derived from a job type and parameters
    DedupeKey {
        job_type: String,
        /// JSON value
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

fn output<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{} must be valid JSON", what))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::DedupeKey { job_type, params } = &cli.command {
        let params = parse_json(params, "params")?;
        return output(&json!({ "dedupe_key": derive_dedupe_key(job_type, &params) }));
    }

    let config = Config::from_env()?;
    let pool = get_pool(&config).await?;
    let store = Arc::new(PostgresJobStore::new(pool));
    let mut service_config = config.service_config();

    match cli.command {
        Commands::Enqueue {
            job_type,
            payload,
            priority,
            run_at,
            dedupe_key,
            org,
            user,
            request_id,
        } => {
            let request = EnqueueRequest {
                job_type,
                payload: parse_json(&payload, "payload")?,
                priority,
                run_at,
                dedupe_key,
            };
            let mut scope = org.map(JobScope::new).unwrap_or_else(JobScope::system);
            scope.user_id = user;
            scope.request_id = request_id;

            let service = JobService::with_config(store, service_config);
            output(&service.enqueue(request, &scope).await?)
        }
        Commands::Get { id, org } => {
            let service = JobService::with_config(store, service_config);
            match service.get(id, org).await? {
                Some(job) => output(&job),
                None => output(&json!({ "success": false, "message": format!("Job {} not found", id) })),
            }
        }
        Commands::List {
            statuses,
            job_type,
            org,
            user,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                statuses,
                job_type,
                org_id: org,
                user_id: user,
            };
            let service = JobService::with_config(store, service_config);
            output(&service.list(&filter, PageArgs { limit, offset }).await?)
        }
        Commands::Stats { org } => {
            let service = JobService::with_config(store, service_config);
            output(&service.stats(org).await?)
        }
        Commands::Retry { ids, org } => {
            let service = JobService::with_config(store, service_config);
            if let [id] = ids.as_slice() {
                output(&json!({ "job_id": id, "success": service.retry(*id, org).await? }))
            } else {
                output(&service.retry_many(&ids, org).await)
            }
        }
        Commands::Cancel { ids, org } => {
            let service = JobService::with_config(store, service_config);
            if let [id] = ids.as_slice() {
                output(&json!({ "job_id": id, "success": service.cancel(*id, org).await? }))
            } else {
                output(&service.cancel_many(&ids, org).await)
            }
        }
        Commands::Cleanup { older_than_days } => {
            if let Some(days) = older_than_days {
                service_config = JobServiceConfig {
                    cleanup_after: retention_from_days(days)?,
                };
            }
            let service = JobService::with_config(store, service_config);
            let cutoff = service.cleanup_cutoff();
            let deleted = service.cleanup().await?;
            output(&json!({ "success": true, "deleted_count": deleted, "cutoff": cutoff }))
        }
        Commands::DedupeKey { .. } => Ok(()),
    }
}

/// Retention window for `--older-than-days`, rejecting windows that reach
/// past the representable calendar.
fn retention_from_days(days: u64) -> Result<Duration> {
    let too_large = || format!("--older-than-days {} is too large", days);

    let secs = days.checked_mul(24 * 3600).with_context(too_large)?;
    let retention = Duration::from_secs(secs);
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .with_context(too_large)?;

    Ok(retention)
}

async fn get_pool(config: &Config) -> Result<PgPool> {
    PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")
}
