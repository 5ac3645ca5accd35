//! Job model for background execution.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::common::db_id;

/// Highest priority (served first).
pub const MIN_PRIORITY: i16 = 1;
/// Lowest priority (served last).
pub const MAX_PRIORITY: i16 = 10;
pub const DEFAULT_PRIORITY: i16 = 5;

// ============================================================================
// Enums
// ============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default,
)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Deadletter,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Deadletter,
        JobStatus::Canceled,
    ];

    /// Statuses eligible for cleanup once past the retention window.
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Deadletter,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Deadletter => "deadletter",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Whether a row with this status is waiting for or undergoing execution.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Whether a row with this status holds its dedupe key.
    pub fn holds_dedupe_key(&self) -> bool {
        matches!(
            self,
            JobStatus::Queued | JobStatus::Running | JobStatus::Succeeded
        )
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    /// Legal status transitions.
    ///
    /// The worker writes running -> deadletter and running -> queued directly
    /// (the intermediate `failed` step is folded into one update).
    /// deadletter -> queued is only reachable through an administrative retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Queued)
                | (Running, Deadletter)
                | (Failed, Queued)
                | (Failed, Deadletter)
                | (Deadletter, Queued)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Structured error identifiers recorded in `jobs.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Handler failed and the retry budget is spent (or the failure was permanent)
    ProcessingError,
    /// Handler failed and the job was requeued with backoff
    RetryScheduled,
    /// Owning worker stopped heartbeating
    WorkerTimeout,
    /// No handler registered for the job type
    UnknownJobType,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ProcessingError => "PROCESSING_ERROR",
            ErrorCode::RetryScheduled => "RETRY_SCHEDULED",
            ErrorCode::WorkerTimeout => "WORKER_TIMEOUT",
            ErrorCode::UnknownJobType => "UNKNOWN_JOB_TYPE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported by a handler, stored in `jobs.progress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub processed: i64,
    pub total: i64,
}

impl JobProgress {
    pub fn new(processed: i64, total: i64) -> Self {
        Self { processed, total }
    }

    /// Percentage complete, capped at 100. `None` when total is unknown.
    pub fn percentage(&self) -> Option<f64> {
        if self.total <= 0 {
            return None;
        }
        Some((self.processed as f64 / self.total as f64 * 100.0).min(100.0))
    }
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = db_id())]
    pub id: Uuid,

    // Core identity
    pub job_type: String,
    pub org_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<Uuid>,
    #[builder(default = serde_json::Value::Object(Default::default()))]
    pub payload: serde_json::Value,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i16,
    #[builder(default = Utc::now())]
    pub run_at: DateTime<Utc>,
    #[builder(default = 0)]
    pub attempts: i32,

    // Worker ownership
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,

    // Results
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub progress: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub error_code: Option<String>,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    // Tracing and deduplication
    #[builder(default, setter(strip_option))]
    pub dedupe_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub request_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub requested_by: Option<Uuid>,

    // Timestamps
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Check if job is in an active state (queued, running)
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Check if job is eligible to be claimed at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.run_at <= now
    }

    /// Check if a running job has gone without a heartbeat for longer than
    /// the visibility timeout
    pub fn is_stuck(&self, visibility_timeout: Duration, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }

        let Ok(timeout) = chrono::Duration::from_std(visibility_timeout) else {
            return false;
        };

        match self.heartbeat_at {
            Some(heartbeat) => heartbeat < now - timeout,
            None => false,
        }
    }

    /// Whether `worker_id` currently owns this job
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.locked_by.as_deref() == Some(worker_id)
    }

    /// Typed view of the stored progress
    pub fn parsed_progress(&self) -> Option<JobProgress> {
        self.progress
            .as_ref()
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Get progress as percentage if progress data is available
    pub fn progress_percentage(&self) -> Option<f64> {
        self.parsed_progress().and_then(|p| p.percentage())
    }

    /// Wall-clock runtime of the latest attempt, once finished
    pub fn runtime(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) if finished >= started => Some(finished - started),
            _ => None,
        }
    }

    /// Clear worker ownership fields
    pub(crate) fn release_lock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
        self.heartbeat_at = None;
    }
}
