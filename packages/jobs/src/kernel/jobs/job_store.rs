//! PostgreSQL implementation of [`JobStore`].
//!
//! Claiming uses `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction and
//! flips the selected rows to running before committing, so concurrent
//! workers never see the same candidate rows.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::job::{ErrorCode, Job, JobProgress, JobStatus};
use super::store::{JobFilter, JobOutcome, JobStats, JobStore, RecoveredJob};
use crate::common::pagination::ValidatedPageArgs;

/// Partial unique index over (org_id, dedupe_key) for active/succeeded rows.
pub const DEDUPE_INDEX: &str = "ix_jobs_dedupe_key_active";

macro_rules! job_columns {
    () => {
        "id, job_type, org_id, user_id, payload, status, priority, run_at, attempts, \
         locked_at, locked_by, heartbeat_at, result, progress, error_code, last_error, \
         dedupe_key, request_id, requested_by, started_at, finished_at, created_at, updated_at"
    };
}

/// Postgres-backed job store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a unique violation on the dedupe index to [`JobError::DedupeConflict`].
fn map_dedupe_violation(err: sqlx::Error, key: impl Into<String>) -> JobError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() && db_err.constraint() == Some(DEDUPE_INDEX) {
            return JobError::DedupeConflict(key.into());
        }
    }
    JobError::Database(err)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> JobResult<Job> {
        let dedupe_key = job.dedupe_key.clone().unwrap_or_default();

        sqlx::query_as::<_, Job>(concat!(
            r#"
            INSERT INTO jobs (
                id, job_type, org_id, user_id, payload, status, priority, run_at, attempts,
                dedupe_key, request_id, requested_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING "#,
            job_columns!()
        ))
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.org_id)
        .bind(job.user_id)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.run_at)
        .bind(job.attempts)
        .bind(&job.dedupe_key)
        .bind(&job.request_id)
        .bind(job.requested_by)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_dedupe_violation(e, dedupe_key))
    }

    async fn find_by_id(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM jobs
            WHERE id = $1
              AND ($2::uuid IS NULL OR org_id = $2)
            "#
        ))
        .bind(id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn find_active_by_dedupe_key(
        &self,
        dedupe_key: &str,
        org_id: Uuid,
    ) -> JobResult<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM jobs
            WHERE dedupe_key = $1
              AND org_id = $2
              AND status IN ('queued', 'running', 'succeeded')
            LIMIT 1
            "#
        ))
        .bind(dedupe_key)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn list(
        &self,
        filter: &JobFilter,
        page: ValidatedPageArgs,
    ) -> JobResult<(Vec<Job>, i64)> {
        let statuses: Vec<String> = filter
            .statuses
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let total = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE (cardinality($1::text[]) = 0 OR status::text = ANY($1))
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::uuid IS NULL OR org_id = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            "#,
        )
        .bind(&statuses)
        .bind(&filter.job_type)
        .bind(filter.org_id)
        .bind(filter.user_id)
        .fetch_one(&self.pool)
        .await?;

        let jobs = sqlx::query_as::<_, Job>(concat!(
            "SELECT ",
            job_columns!(),
            r#"
            FROM jobs
            WHERE (cardinality($1::text[]) = 0 OR status::text = ANY($1))
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::uuid IS NULL OR org_id = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY created_at DESC, id DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(&statuses)
        .bind(&filter.job_type)
        .bind(filter.org_id)
        .bind(filter.user_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((jobs, total))
    }

    async fn stats(&self, org_id: Option<Uuid>) -> JobResult<JobStats> {
        let by_status: BTreeMap<String, i64> = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status::text, COUNT(*)
            FROM jobs
            WHERE ($1::uuid IS NULL OR org_id = $1)
            GROUP BY status
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let by_type: BTreeMap<String, i64> = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT job_type, COUNT(*)
            FROM jobs
            WHERE ($1::uuid IS NULL OR org_id = $1)
            GROUP BY job_type
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .collect();

        let failed_last_hour = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM jobs
            WHERE ($1::uuid IS NULL OR org_id = $1)
              AND status IN ('failed', 'deadletter')
              AND updated_at >= NOW() - INTERVAL '1 hour'
            "#,
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let avg_runtime_seconds = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (finished_at - started_at)))::FLOAT8
            FROM jobs
            WHERE ($1::uuid IS NULL OR org_id = $1)
              AND status = 'succeeded'
              AND started_at IS NOT NULL
              AND finished_at IS NOT NULL
            "#,
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;

        let total = by_status.values().sum();
        let queue_depth = by_status.get(JobStatus::Queued.as_str()).copied().unwrap_or(0)
            + by_status.get(JobStatus::Running.as_str()).copied().unwrap_or(0);

        Ok(JobStats {
            total,
            by_status,
            by_type,
            queue_depth,
            failed_last_hour,
            avg_runtime_seconds,
        })
    }

    async fn retry(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = NOW(),
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('failed', 'deadletter')
              AND ($2::uuid IS NULL OR org_id = $2)
            "#,
        )
        .bind(id)
        .bind(org_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => Ok(result.rows_affected() > 0),
            Err(e) => match map_dedupe_violation(e, String::new()) {
                JobError::DedupeConflict(_) => {
                    let key = sqlx::query_scalar::<_, Option<String>>(
                        "SELECT dedupe_key FROM jobs WHERE id = $1",
                    )
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?
                    .flatten()
                    .unwrap_or_default();
                    Err(JobError::DedupeConflict(key))
                }
                other => Err(other),
            },
        }
    }

    async fn cancel(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('queued', 'running')
              AND ($2::uuid IS NULL OR org_id = $2)
            "#,
        )
        .bind(id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> JobResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status IN ('succeeded', 'failed', 'deadletter', 'canceled')
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> JobResult<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let candidate_ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'queued'
              AND run_at <= NOW()
            ORDER BY priority ASC, run_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if candidate_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let mut jobs = sqlx::query_as::<_, Job>(concat!(
            r#"
            UPDATE jobs
            SET status = 'running',
                locked_at = NOW(),
                locked_by = $2,
                heartbeat_at = NOW(),
                attempts = attempts + 1,
                started_at = NOW(),
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = ANY($1)
            RETURNING "#,
            job_columns!()
        ))
        .bind(&candidate_ids)
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        jobs.sort_by(|a, b| (a.priority, a.run_at).cmp(&(b.priority, b.run_at)));

        debug!(
            worker_id = %worker_id,
            count = jobs.len(),
            "claimed jobs"
        );

        Ok(jobs)
    }

    async fn complete(&self, id: Uuid, worker_id: &str, outcome: JobOutcome) -> JobResult<bool> {
        let query = match outcome {
            JobOutcome::Succeeded { result } => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'succeeded',
                    result = $3,
                    locked_at = NULL,
                    locked_by = NULL,
                    heartbeat_at = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(id)
            .bind(worker_id)
            .bind(result),
            JobOutcome::Canceled => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'canceled',
                    locked_at = NULL,
                    locked_by = NULL,
                    heartbeat_at = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(id)
            .bind(worker_id),
            JobOutcome::Retry { run_at, error } => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'queued',
                    run_at = $3,
                    last_error = $4,
                    error_code = $5,
                    locked_at = NULL,
                    locked_by = NULL,
                    heartbeat_at = NULL,
                    updated_at = NOW()
                WHERE id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(id)
            .bind(worker_id)
            .bind(run_at)
            .bind(error)
            .bind(ErrorCode::RetryScheduled.as_str()),
            JobOutcome::Failed { code, error } => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $3,
                    error_code = $4,
                    locked_at = NULL,
                    locked_by = NULL,
                    heartbeat_at = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(id)
            .bind(worker_id)
            .bind(error)
            .bind(code.as_str()),
            JobOutcome::Deadletter { code, error } => sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'deadletter',
                    last_error = $3,
                    error_code = $4,
                    locked_at = NULL,
                    locked_by = NULL,
                    heartbeat_at = NULL,
                    finished_at = NOW(),
                    updated_at = NOW()
                WHERE id = $1 AND locked_by = $2 AND status = 'running'
                "#,
            )
            .bind(id)
            .bind(worker_id)
            .bind(error)
            .bind(code.as_str()),
        };

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> JobResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = $3,
                updated_at = NOW()
            WHERE id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(Json(progress))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, worker_id: &str) -> JobResult<Vec<Uuid>> {
        let owned = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET heartbeat_at = NOW()
            WHERE locked_by = $1 AND status = 'running'
            RETURNING id
            "#,
        )
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(owned)
    }

    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
    ) -> JobResult<Vec<RecoveredJob>> {
        let recovered = sqlx::query_as::<_, RecoveredJob>(
            r#"
            WITH stale AS (
                SELECT id, locked_by
                FROM jobs
                WHERE status = 'running'
                  AND heartbeat_at < $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = CASE
                    WHEN jobs.attempts >= $2 THEN 'deadletter'::job_status
                    ELSE 'queued'::job_status
                END,
                locked_at = NULL,
                locked_by = NULL,
                heartbeat_at = NULL,
                error_code = $3,
                last_error = $4,
                finished_at = CASE WHEN jobs.attempts >= $2 THEN NOW() ELSE NULL END,
                updated_at = NOW()
            FROM stale
            WHERE jobs.id = stale.id
            RETURNING jobs.id, jobs.status, jobs.attempts, stale.locked_by AS previous_owner
            "#,
        )
        .bind(stale_before)
        .bind(max_attempts)
        .bind(ErrorCode::WorkerTimeout.as_str())
        .bind(format!(
            "worker heartbeat older than {}",
            stale_before.to_rfc3339()
        ))
        .fetch_all(&self.pool)
        .await?;

        if !recovered.is_empty() {
            let deadlettered = recovered
                .iter()
                .filter(|job| job.status == JobStatus::Deadletter)
                .count();
            info!(
                recovered = recovered.len(),
                deadlettered,
                "recovered stuck jobs"
            );
        }

        Ok(recovered)
    }
}
