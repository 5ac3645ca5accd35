//! Job testing utilities.
//!
//! [`MemoryJobStore`] implements [`JobStore`] over an in-process map with the
//! same transition, ownership, and dedupe rules as the Postgres store, so
//! service and worker behavior can be tested without a database.
//! [`MockJobHandler`] records invocations and fails on demand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::job::{ErrorCode, Job, JobProgress, JobStatus};
use super::registry::{JobContext, JobHandler};
use super::store::{JobFilter, JobOutcome, JobStats, JobStore, RecoveredJob};
use crate::common::pagination::ValidatedPageArgs;

/// In-memory job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    heartbeat_delay: RwLock<Option<Duration>>,
    injected_dedupe_conflicts: AtomicUsize,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all jobs.
    pub fn jobs(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Get a job by ID regardless of scope.
    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Move a job's heartbeat into the past to simulate a dead worker.
    pub fn backdate_heartbeat(&self, id: Uuid, by: Duration) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            if let (Some(heartbeat), Ok(by)) = (job.heartbeat_at, chrono::Duration::from_std(by)) {
                job.heartbeat_at = Some(heartbeat - by);
            }
        }
    }

    /// Make a scheduled job ready to claim now.
    pub fn make_ready(&self, id: Uuid) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            job.run_at = Utc::now();
        }
    }

    /// Move a job's updated_at into the past.
    pub fn backdate_updated_at(&self, id: Uuid, by: Duration) {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        if let Some(job) = jobs.get_mut(&id) {
            if let Ok(by) = chrono::Duration::from_std(by) {
                job.updated_at -= by;
            }
        }
    }

    /// Stall every heartbeat after its rows are read, before it returns.
    pub fn delay_heartbeats(&self, delay: Duration) {
        *self
            .heartbeat_delay
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// Reject the next `count` inserts that carry a dedupe key with
    /// `DedupeConflict`, without writing anything, as if a concurrent
    /// enqueue had won and then left the dedupe-holding statuses.
    pub fn inject_dedupe_conflicts(&self, count: usize) {
        self.injected_dedupe_conflicts.store(count, Ordering::SeqCst);
    }

    fn dedupe_holder<'a>(
        jobs: &'a HashMap<Uuid, Job>,
        dedupe_key: &str,
        org_id: Uuid,
        except: Option<Uuid>,
    ) -> Option<&'a Job> {
        jobs.values().find(|job| {
            Some(job.id) != except
                && job.org_id == org_id
                && job.status.holds_dedupe_key()
                && job.dedupe_key.as_deref() == Some(dedupe_key)
        })
    }
}

fn in_scope(job: &Job, org_id: Option<Uuid>) -> bool {
    org_id.map_or(true, |org| org == job.org_id)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> JobResult<Job> {
        if let Some(key) = job.dedupe_key.as_deref() {
            let injected = self
                .injected_dedupe_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(JobError::DedupeConflict(key.to_string()));
            }
        }

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        if let Some(key) = job.dedupe_key.as_deref() {
            if job.status.holds_dedupe_key()
                && Self::dedupe_holder(&jobs, key, job.org_id, None).is_some()
            {
                return Err(JobError::DedupeConflict(key.to_string()));
            }
        }

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<Option<Job>> {
        Ok(self.get(id).filter(|job| in_scope(job, org_id)))
    }

    async fn find_active_by_dedupe_key(
        &self,
        dedupe_key: &str,
        org_id: Uuid,
    ) -> JobResult<Option<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(Self::dedupe_holder(&jobs, dedupe_key, org_id, None).cloned())
    }

    async fn list(
        &self,
        filter: &JobFilter,
        page: ValidatedPageArgs,
    ) -> JobResult<(Vec<Job>, i64)> {
        let mut matching: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|job| filter.matches(job))
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect();

        Ok((items, total))
    }

    async fn stats(&self, org_id: Option<Uuid>) -> JobResult<JobStats> {
        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let mut stats = JobStats::default();
        let mut runtimes = Vec::new();

        for job in self.jobs().iter().filter(|job| in_scope(job, org_id)) {
            stats.total += 1;
            *stats
                .by_status
                .entry(job.status.as_str().to_string())
                .or_default() += 1;
            *stats.by_type.entry(job.job_type.clone()).or_default() += 1;

            if job.status.is_active() {
                stats.queue_depth += 1;
            }
            if matches!(job.status, JobStatus::Failed | JobStatus::Deadletter)
                && job.updated_at >= hour_ago
            {
                stats.failed_last_hour += 1;
            }
            if job.status == JobStatus::Succeeded {
                if let Some(runtime) = job.runtime() {
                    runtimes.push(runtime.num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        if !runtimes.is_empty() {
            stats.avg_runtime_seconds = Some(runtimes.iter().sum::<f64>() / runtimes.len() as f64);
        }

        Ok(stats)
    }

    async fn retry(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let Some(job) = jobs.get(&id).filter(|job| in_scope(job, org_id)) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Failed | JobStatus::Deadletter) {
            return Ok(false);
        }
        if let Some(key) = job.dedupe_key.clone() {
            if Self::dedupe_holder(&jobs, &key, job.org_id, Some(id)).is_some() {
                return Err(JobError::DedupeConflict(key));
            }
        }

        let now = Utc::now();
        if let Some(job) = jobs.get_mut(&id) {
            job.status = JobStatus::Queued;
            job.run_at = now;
            job.release_lock();
            job.finished_at = None;
            job.updated_at = now;
        }
        Ok(true)
    }

    async fn cancel(&self, id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        match jobs.get_mut(&id) {
            Some(job) if in_scope(job, org_id) && job.status.is_active() => {
                let now = Utc::now();
                job.status = JobStatus::Canceled;
                job.release_lock();
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> JobResult<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < older_than));
        Ok((before - jobs.len()) as u64)
    }

    async fn claim(&self, worker_id: &str, limit: i64) -> JobResult<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let mut ready: Vec<(i16, DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|job| job.is_ready(now))
            .map(|job| (job.priority, job.run_at, job.id))
            .collect();
        ready.sort();
        ready.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, _, id) in ready {
            if let Some(job) = jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.locked_at = Some(now);
                job.locked_by = Some(worker_id.to_string());
                job.heartbeat_at = Some(now);
                job.attempts += 1;
                job.started_at = Some(now);
                job.finished_at = None;
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, worker_id: &str, outcome: JobOutcome) -> JobResult<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        let Some(job) = jobs.get_mut(&id).filter(|job| job.is_owned_by(worker_id)) else {
            return Ok(false);
        };

        let now = Utc::now();
        job.status = outcome.status();
        job.release_lock();
        job.updated_at = now;

        match outcome {
            JobOutcome::Succeeded { result } => {
                job.result = result;
                job.finished_at = Some(now);
            }
            JobOutcome::Canceled => {
                job.finished_at = Some(now);
            }
            JobOutcome::Retry { run_at, error } => {
                job.run_at = run_at;
                job.last_error = Some(error);
                job.error_code = Some(ErrorCode::RetryScheduled.as_str().to_string());
            }
            JobOutcome::Failed { code, error } | JobOutcome::Deadletter { code, error } => {
                job.last_error = Some(error);
                job.error_code = Some(code.as_str().to_string());
                job.finished_at = Some(now);
            }
        }

        Ok(true)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        worker_id: &str,
        progress: JobProgress,
    ) -> JobResult<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());

        match jobs.get_mut(&id) {
            Some(job) if job.is_owned_by(worker_id) => {
                job.progress = Some(
                    serde_json::to_value(progress).map_err(|e| JobError::Internal(e.into()))?,
                );
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, worker_id: &str) -> JobResult<Vec<Uuid>> {
        let owned: Vec<Uuid> = {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            let now = Utc::now();
            jobs.values_mut()
                .filter(|job| job.is_owned_by(worker_id))
                .map(|job| {
                    job.heartbeat_at = Some(now);
                    job.id
                })
                .collect()
        };

        let delay = *self
            .heartbeat_delay
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(owned)
    }

    async fn recover_stuck(
        &self,
        stale_before: DateTime<Utc>,
        max_attempts: i32,
    ) -> JobResult<Vec<RecoveredJob>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut recovered = Vec::new();

        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job.heartbeat_at.is_some_and(|heartbeat| heartbeat < stale_before);
            if !stale {
                continue;
            }

            let previous_owner = job.locked_by.clone();
            job.status = if job.attempts >= max_attempts {
                JobStatus::Deadletter
            } else {
                JobStatus::Queued
            };
            job.release_lock();
            job.error_code = Some(ErrorCode::WorkerTimeout.as_str().to_string());
            job.last_error = Some(format!(
                "worker heartbeat older than {}",
                stale_before.to_rfc3339()
            ));
            job.finished_at = (job.status == JobStatus::Deadletter).then_some(now);
            job.updated_at = now;

            recovered.push(RecoveredJob {
                id: job.id,
                status: job.status,
                attempts: job.attempts,
                previous_owner,
            });
        }

        Ok(recovered)
    }
}

/// What a [`MockJobHandler`] does when invoked.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed(Option<Value>),
    /// Retryable failure
    Fail(String),
    /// Failure marked [`JobError::Permanent`]
    FailPermanent(String),
    Panic(String),
    /// Sleep, then succeed unless the context was canceled meanwhile
    Sleep(Duration),
    /// Block until the context is canceled, then return [`JobError::Canceled`]
    WaitForCancel,
}

/// A mock job handler for testing.
///
/// Records all invocations for later inspection.
pub struct MockJobHandler {
    behavior: RwLock<MockBehavior>,
    invocations: RwLock<Vec<(Uuid, i32)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockJobHandler {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: RwLock::new(behavior),
            invocations: RwLock::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(MockBehavior::Succeed(None))
    }

    /// Set what subsequent invocations do.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.write().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// (job id, attempt) per invocation, in call order.
    pub fn invocations(&self) -> Vec<(Uuid, i32)> {
        self.invocations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Highest number of concurrent invocations observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for MockJobHandler {
    async fn handle(&self, ctx: JobContext, _payload: Value) -> Result<Option<Value>> {
        self.invocations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((ctx.job_id, ctx.attempt));

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let behavior = self
            .behavior
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let result = match behavior {
            MockBehavior::Succeed(result) => Ok(result),
            MockBehavior::Fail(message) => Err(anyhow!(message)),
            MockBehavior::FailPermanent(message) => Err(JobError::Permanent(message).into()),
            MockBehavior::Panic(message) => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                panic!("{}", message);
            }
            MockBehavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                ctx.checkpoint().map(|_| None)
            }
            MockBehavior::WaitForCancel => {
                ctx.cancelled().await;
                Err(JobError::Canceled.into())
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn org() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    fn queued(job_type: &str) -> Job {
        Job::builder().job_type(job_type).org_id(org()).build()
    }

    #[tokio::test]
    async fn test_dedupe_key_held_by_active_rows_only() {
        let store = MemoryJobStore::new();
        let first = Job::builder()
            .job_type("sync")
            .org_id(org())
            .dedupe_key("k1")
            .build();
        store.insert(first.clone()).await.unwrap();

        let dup = Job::builder()
            .job_type("sync")
            .org_id(org())
            .dedupe_key("k1")
            .build();
        assert!(matches!(
            store.insert(dup.clone()).await,
            Err(JobError::DedupeConflict(_))
        ));

        // Other scopes do not collide
        let other_org = Job::builder()
            .job_type("sync")
            .org_id(Uuid::nil())
            .dedupe_key("k1")
            .build();
        assert!(store.insert(other_org).await.is_ok());

        // Releasing the key allows reuse
        assert!(store.cancel(first.id, None).await.unwrap());
        assert!(store.insert(dup).await.is_ok());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_run_at() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let low = Job::builder()
            .job_type("a")
            .org_id(org())
            .priority(9i16)
            .run_at(now - chrono::Duration::seconds(30))
            .build();
        let high_late = Job::builder()
            .job_type("a")
            .org_id(org())
            .priority(1i16)
            .run_at(now - chrono::Duration::seconds(1))
            .build();
        let high_early = Job::builder()
            .job_type("a")
            .org_id(org())
            .priority(1i16)
            .run_at(now - chrono::Duration::seconds(10))
            .build();
        let future = Job::builder()
            .job_type("a")
            .org_id(org())
            .priority(1i16)
            .run_at(now + chrono::Duration::hours(1))
            .build();
        for job in [&low, &high_late, &high_early, &future] {
            store.insert(job.clone()).await.unwrap();
        }

        let claimed = store.claim("w1", 10).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
        assert!(claimed.iter().all(|j| j.attempts == 1 && j.is_owned_by("w1")));
    }

    #[tokio::test]
    async fn test_complete_requires_ownership() {
        let store = MemoryJobStore::new();
        let job = store.insert(queued("a")).await.unwrap();
        store.claim("w1", 1).await.unwrap();

        let outcome = JobOutcome::Succeeded { result: None };
        assert!(!store.complete(job.id, "w2", outcome.clone()).await.unwrap());
        assert!(store.complete(job.id, "w1", outcome.clone()).await.unwrap());
        // Second write is rejected, row is no longer running
        assert!(!store.complete(job.id, "w1", outcome).await.unwrap());
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_terminal_rows() {
        let store = MemoryJobStore::new();
        let active = store.insert(queued("a")).await.unwrap();
        let done = store.insert(queued("a")).await.unwrap();
        store.cancel(done.id, None).await.unwrap();
        store.backdate_updated_at(active.id, Duration::from_secs(86_400 * 40));
        store.backdate_updated_at(done.id, Duration::from_secs(86_400 * 40));

        let removed = store
            .cleanup(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        assert!(store.get(active.id).is_some());
        assert!(store.get(done.id).is_none());
    }

    #[tokio::test]
    async fn test_retry_conflict_reports_dedupe_key() {
        let store = MemoryJobStore::new();
        let keyed = |key: &str| Job::builder().job_type("a").org_id(org()).dedupe_key(key).build();
        let dead = store.insert(keyed("nightly")).await.unwrap();
        store.claim("w1", 1).await.unwrap();
        let outcome = JobOutcome::Deadletter {
            code: ErrorCode::ProcessingError,
            error: "boom".into(),
        };
        assert!(store.complete(dead.id, "w1", outcome).await.unwrap());
        store.insert(keyed("nightly")).await.unwrap();

        match store.retry(dead.id, None).await {
            Err(JobError::DedupeConflict(key)) => assert_eq!(key, "nightly"),
            other => panic!("expected dedupe conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_written_only_by_owner() {
        let store = MemoryJobStore::new();
        let job = store.insert(queued("a")).await.unwrap();
        store.claim("w1", 1).await.unwrap();

        assert!(!store
            .update_progress(job.id, "w2", JobProgress::new(1, 4))
            .await
            .unwrap());
        assert!(store
            .update_progress(job.id, "w1", JobProgress::new(3, 4))
            .await
            .unwrap());

        assert_eq!(
            store.get(job.id).unwrap().parsed_progress(),
            Some(JobProgress::new(3, 4))
        );
    }
}
