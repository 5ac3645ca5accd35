//! Test fixtures for creating and manipulating job rows.

use std::time::Duration;

use anyhow::Result;
use jobs_core::kernel::jobs::{EnqueueRequest, JobScope, JobService};
use sqlx::PgPool;
use uuid::Uuid;

/// Enqueue a job of `job_type` with an empty payload.
pub async fn enqueue_test_job(service: &JobService, job_type: &str, org_id: Uuid) -> Result<Uuid> {
    let result = service
        .enqueue(
            EnqueueRequest::builder().job_type(job_type).build(),
            &JobScope::new(org_id),
        )
        .await?;
    Ok(result.job_id)
}

/// Make a scheduled retry claimable now.
pub async fn make_ready(pool: &PgPool, job_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE jobs SET run_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Age a running job's heartbeat, as if its worker died.
pub async fn backdate_heartbeat(pool: &PgPool, job_id: Uuid, by: Duration) -> Result<()> {
    sqlx::query("UPDATE jobs SET heartbeat_at = heartbeat_at - make_interval(secs => $2) WHERE id = $1")
        .bind(job_id)
        .bind(by.as_secs_f64())
        .execute(pool)
        .await?;
    Ok(())
}

/// Age a row's updated_at, to exercise retention.
pub async fn backdate_updated_at(pool: &PgPool, job_id: Uuid, by: Duration) -> Result<()> {
    sqlx::query("UPDATE jobs SET updated_at = updated_at - make_interval(secs => $2) WHERE id = $1")
        .bind(job_id)
        .bind(by.as_secs_f64())
        .execute(pool)
        .await?;
    Ok(())
}

pub fn test_org() -> Uuid {
    Uuid::now_v7()
}
