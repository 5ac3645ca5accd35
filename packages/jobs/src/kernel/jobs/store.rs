//! Persistence seam for the job table.
//!
//! `JobStore` is the only component that reads or writes job rows. All
//! coordination between workers happens through the atomicity of
//! [`JobStore::claim`] and through writes scoped to the owning worker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::JobResult;
use super::job::{ErrorCode, Job, JobProgress, JobStatus};
use crate::common::pagination::ValidatedPageArgs;

/// Filters for listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    /// Match any of these statuses (empty = all)
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<String>,
    pub org_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

impl JobFilter {
    pub fn for_org(org_id: Uuid) -> Self {
        Self {
            org_id: Some(org_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.as_deref().map_or(true, |t| t == job.job_type)
            && self.org_id.map_or(true, |org| org == job.org_id)
            && self.user_id.map_or(true, |user| Some(user) == job.user_id)
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub by_status: BTreeMap<String, i64>,
    pub by_type: BTreeMap<String, i64>,
    /// queued + running
    pub queue_depth: i64,
    /// Jobs that entered failed or deadletter within the last hour
    pub failed_last_hour: i64,
    /// Mean runtime of succeeded jobs
    pub avg_runtime_seconds: Option<f64>,
}

impl JobStats {
    pub fn count(&self, status: JobStatus) -> i64 {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

/// How a claimed job ended, written back by the owning worker.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded {
        result: Option<serde_json::Value>,
    },
    Canceled,
    /// Requeue for another attempt at `run_at`
    Retry {
        run_at: DateTime<Utc>,
        error: String,
    },
    /// Stop without deadlettering; eligible for administrative retry
    Failed {
        code: ErrorCode,
        error: String,
    },
    Deadletter {
        code: ErrorCode,
        error: String,
    },
}

impl JobOutcome {
    /// Status the row lands in.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Canceled => JobStatus::Canceled,
            JobOutcome::Retry { .. } => JobStatus::Queued,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Deadletter { .. } => JobStatus::Deadletter,
        }
    }
}

/// A running job whose heartbeat went stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RecoveredJob {
    pub id: Uuid,
    /// queued, or deadletter when the attempt budget was already spent
    pub status: JobStatus,
    pub attempts: i32,
    pub previous_owner: Option<String>,
}

/// Storage operations for jobs.
///
/// Every write that belongs to a worker (`complete`, `update_progress`,
/// `heartbeat`) is conditional on `status = 'running' AND locked_by = worker`
/// and reports whether it applied, so a worker that lost ownership can never
/// clobber a row that was canceled or recovered in the meantime.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new queued job.
    ///
    /// Returns [`JobError::DedupeConflict`](super::JobError::DedupeConflict)
    /// when another row already holds the job's dedupe key in its scope.
    async fn insert(&self, job: Job) -> JobResult<Job>;

    async fn find_by_id(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<Option<Job>>;

    /// Find the queued, running, or succeeded job holding a dedupe key.
    async fn find_active_by_dedupe_key(
        &self,
        dedupe_key: &str,
        org_id: Uuid,
    ) -> JobResult<Option<Job>>;

    /// List jobs newest first, with the unpaginated total.
    async fn list(&self, filter: &JobFilter, page: ValidatedPageArgs)
        -> JobResult<(Vec<Job>, i64)>;

    async fn stats(&self, org_id: Option<Uuid>) -> JobResult<JobStats>;

    /// failed/deadletter -> queued with run_at = now. False if not eligible.
    async fn retry(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool>;

    /// queued/running -> canceled. False if not eligible.
    async fn cancel(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool>;

    /// Delete terminal jobs last updated before `older_than`.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> JobResult<u64>;

    /// Atomically claim up to `limit` ready jobs for `worker_id`.
    ///
    /// Ready means queued with run_at <= now, served by (priority, run_at).
    /// Claimed rows become running with fresh lock fields and attempts + 1.
    async fn claim(&self, worker_id: &str, limit: i64) -> JobResult<Vec<Job>>;

    /// Write the outcome of a job owned by `worker_id`.
    async fn complete(&self, id: Uuid, worker_id: &str, outcome: JobOutcome) -> JobResult<bool>;

    async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> JobResult<bool>;

    /// Refresh heartbeat_at for every running job owned by `worker_id`.
    ///
    /// Returns the ids still owned.
    async fn heartbeat(&self, worker_id: &str) -> JobResult<Vec<Uuid>>;

    /// Requeue running jobs whose heartbeat is older than `stale_before`.
    ///
    /// Jobs that already used `max_attempts` are deadlettered instead.
    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
    ) -> JobResult<Vec<RecoveredJob>>;
}
