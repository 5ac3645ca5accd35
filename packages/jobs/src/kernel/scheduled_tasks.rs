//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! Scheduled tasks never do work directly; they enqueue jobs. Every worker
//! process runs the same schedule, and the per-day dedupe key collapses the
//! concurrent enqueues into a single job.
//!
//! ```text
//! Scheduler (JOB_CLEANUP_CRON, default 03:00 daily)
//!     │
//!     └─► enqueue maintenance_cleanup (dedupe key: type + date, system scope)
//!             └─► JobWorker ─► MaintenanceCleanupHandler ─► JobService::cleanup
//! ```

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::kernel::jobs::handlers::MAINTENANCE_CLEANUP_JOB;
use crate::kernel::jobs::{EnqueueRequest, EnqueueResult, JobScope, JobService, MAX_PRIORITY};

/// Start all scheduled tasks
pub async fn start_scheduler(service: JobService, cleanup_cron: &str) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    let cleanup_service = service.clone();
    let cleanup_job = Job::new_async(cleanup_cron, move |_uuid, _lock| {
        let service = cleanup_service.clone();
        Box::pin(async move {
            if let Err(e) = enqueue_daily_cleanup(&service, Utc::now().date_naive()).await {
                tracing::error!(error = %e, "Scheduling maintenance cleanup failed");
            }
        })
    })?;

    scheduler.add(cleanup_job).await?;
    scheduler.start().await?;

    tracing::info!(cron = %cleanup_cron, "Scheduled tasks started (maintenance cleanup)");
    Ok(scheduler)
}

/// Enqueue the maintenance job for `date`, once per day across all workers.
pub async fn enqueue_daily_cleanup(service: &JobService, date: NaiveDate) -> Result<EnqueueResult> {
    let params = json!({ "date": date.to_string() });
    let dedupe_key = service.derive_dedupe_key(MAINTENANCE_CLEANUP_JOB, &params);

    let request = EnqueueRequest::builder()
        .job_type(MAINTENANCE_CLEANUP_JOB)
        .payload(json!({ "tasks": ["cleanup_jobs"], "dry_run": false }))
        .priority(MAX_PRIORITY)
        .dedupe_key(dedupe_key)
        .build();

    let result = service.enqueue(request, &JobScope::system()).await?;

    if result.deduplicated {
        tracing::debug!(job_id = %result.job_id, "Maintenance cleanup already scheduled today");
    } else {
        tracing::info!(job_id = %result.job_id, date = %date, "Maintenance cleanup enqueued");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kernel::jobs::testing::MemoryJobStore;

    #[tokio::test]
    async fn test_daily_cleanup_enqueued_once_per_day() {
        let store = Arc::new(MemoryJobStore::new());
        let service = JobService::new(store.clone());
        let today = NaiveDate::from_ymd_opt(2025, 9, 3).unwrap();
        let tomorrow = today.succ_opt().unwrap();

        let first = enqueue_daily_cleanup(&service, today).await.unwrap();
        let second = enqueue_daily_cleanup(&service, today).await.unwrap();
        let next_day = enqueue_daily_cleanup(&service, tomorrow).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
        assert_ne!(first.job_id, next_day.job_id);

        let job = store.get(first.job_id).unwrap();
        assert_eq!(job.job_type, MAINTENANCE_CLEANUP_JOB);
        assert_eq!(job.priority, MAX_PRIORITY);
        assert!(job.org_id.is_nil());
    }
}
