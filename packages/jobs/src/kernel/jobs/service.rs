//! Producer and operator API over the job store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::job::{Job, JobStatus, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
use super::store::{JobFilter, JobStats, JobStore};
use crate::common::pagination::{Page, PageArgs};
use crate::common::utils::derive_dedupe_key;

const MAX_JOB_TYPE_LEN: usize = 255;
const MAX_DEDUPE_KEY_LEN: usize = 255;
/// Insert attempts that may lose a dedupe race to a vanishing winner
const MAX_DEDUPE_RACES: u32 = 3;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct JobServiceConfig {
    /// Terminal jobs older than this are removed by [`JobService::cleanup`]
    pub cleanup_after: Duration,
}

impl Default for JobServiceConfig {
    fn default() -> Self {
        Self {
            cleanup_after: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Caller identity attached to enqueued jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScope {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_id: Option<String>,
}

impl JobScope {
    pub fn new(org_id: Uuid) -> Self {
        Self {
            org_id,
            user_id: None,
            request_id: None,
        }
    }

    /// Scope for jobs enqueued by the system itself (scheduled maintenance).
    pub fn system() -> Self {
        Self::new(Uuid::nil())
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A request to enqueue a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct EnqueueRequest {
    pub job_type: String,
    #[builder(default = json!({}))]
    pub payload: Value,
    /// 1 (first) to 10 (last); defaults to 5
    #[builder(default, setter(strip_option))]
    pub priority: Option<i16>,
    /// Defaults to now
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub dedupe_key: Option<String>,
}

impl EnqueueRequest {
    fn validate(&self) -> JobResult<()> {
        let job_type = self.job_type.trim();
        if job_type.is_empty() {
            return Err(JobError::Validation("job_type must not be empty".into()));
        }
        if job_type.len() > MAX_JOB_TYPE_LEN {
            return Err(JobError::Validation(format!(
                "job_type must be at most {} characters",
                MAX_JOB_TYPE_LEN
            )));
        }

        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                return Err(JobError::Validation(format!(
                    "priority must be between {} and {}, got {}",
                    MIN_PRIORITY, MAX_PRIORITY, priority
                )));
            }
        }

        if !self.payload.is_object() {
            return Err(JobError::Validation("payload must be a JSON object".into()));
        }

        if let Some(key) = &self.dedupe_key {
            if key.trim().is_empty() {
                return Err(JobError::Validation("dedupe_key must not be empty".into()));
            }
            if key.len() > MAX_DEDUPE_KEY_LEN {
                return Err(JobError::Validation(format!(
                    "dedupe_key must be at most {} characters",
                    MAX_DEDUPE_KEY_LEN
                )));
            }
        }

        Ok(())
    }
}

/// Result of an enqueue.
///
/// `deduplicated` is true when an existing job holding the dedupe key was
/// returned instead of creating a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub deduplicated: bool,
}

impl EnqueueResult {
    fn created(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            deduplicated: false,
        }
    }

    fn duplicate(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            deduplicated: true,
        }
    }
}

/// Per-id results of a batch admin action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobActionReport {
    pub success_ids: Vec<Uuid>,
    pub failed_ids: Vec<Uuid>,
    /// Error message by job id for ids that raised an error
    pub errors: BTreeMap<String, String>,
}

/// Enqueue, query, and administer jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    config: JobServiceConfig,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_config(store, JobServiceConfig::default())
    }

    pub fn with_config(store: Arc<dyn JobStore>, config: JobServiceConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue a job, or return the job already holding its dedupe key.
    ///
    /// A concurrent enqueue that wins the insert race is returned as a
    /// duplicate rather than surfaced as an error.
    pub async fn enqueue(&self, request: EnqueueRequest, scope: &JobScope) -> JobResult<EnqueueResult> {
        request.validate()?;

        if let Some(key) = &request.dedupe_key {
            if let Some(existing) = self.store.find_active_by_dedupe_key(key, scope.org_id).await? {
                debug!(
                    job_id = %existing.id,
                    dedupe_key = %key,
                    "enqueue deduplicated"
                );
                return Ok(EnqueueResult::duplicate(&existing));
            }
        }

        let job = Job {
            job_type: request.job_type.trim().to_string(),
            payload: request.payload,
            priority: request.priority.unwrap_or(DEFAULT_PRIORITY),
            run_at: request.run_at.unwrap_or_else(Utc::now),
            dedupe_key: request.dedupe_key,
            user_id: scope.user_id,
            request_id: scope.request_id.clone(),
            requested_by: scope.user_id,
            ..Job::builder().job_type(String::new()).org_id(scope.org_id).build()
        };

        let mut races = 0;
        loop {
            match self.store.insert(job.clone()).await {
                Ok(job) => {
                    info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        org_id = %job.org_id,
                        priority = job.priority,
                        run_at = %job.run_at,
                        "job enqueued"
                    );
                    return Ok(EnqueueResult::created(&job));
                }
                Err(JobError::DedupeConflict(key)) => {
                    // Lost the race: the winner holds the key now
                    if let Some(winner) =
                        self.store.find_active_by_dedupe_key(&key, scope.org_id).await?
                    {
                        debug!(
                            job_id = %winner.id,
                            dedupe_key = %key,
                            "enqueue lost dedupe race, returning winner"
                        );
                        return Ok(EnqueueResult::duplicate(&winner));
                    }

                    // Winner left the dedupe-holding statuses in between
                    races += 1;
                    if races >= MAX_DEDUPE_RACES {
                        return Err(JobError::Internal(anyhow!(
                            "dedupe key {} kept changing hands during enqueue",
                            key
                        )));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Get a job, optionally restricted to an org.
    pub async fn get(&self, job_id: Uuid, org_id: Option<Uuid>) -> JobResult<Option<Job>> {
        self.store.find_by_id(job_id, org_id).await
    }

    /// List jobs newest first.
    pub async fn list(&self, filter: &JobFilter, page: PageArgs) -> JobResult<Page<Job>> {
        let page = page
            .validate()
            .map_err(|e| JobError::Validation(e.to_string()))?;
        let (jobs, total) = self.store.list(filter, page).await?;
        Ok(Page::new(jobs, total, page))
    }

    pub async fn stats(&self, org_id: Option<Uuid>) -> JobResult<JobStats> {
        self.store.stats(org_id).await
    }

    /// Requeue a failed or deadlettered job to run now.
    ///
    /// Returns false when the job is missing, not retryable, or its dedupe
    /// key has since been taken by another job.
    pub async fn retry(&self, job_id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        match self.store.retry(job_id, org_id).await {
            Ok(true) => {
                info!(job_id = %job_id, "job requeued by retry");
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(JobError::DedupeConflict(key)) => {
                warn!(
                    job_id = %job_id,
                    dedupe_key = %key,
                    "retry skipped, dedupe key held by another job"
                );
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel a queued or running job.
    ///
    /// Canceling a running job is advisory: the owning worker notices on its
    /// next heartbeat and signals the handler to stop.
    pub async fn cancel(&self, job_id: Uuid, org_id: Option<Uuid>) -> JobResult<bool> {
        let canceled = self.store.cancel(job_id, org_id).await?;
        if canceled {
            info!(job_id = %job_id, "job canceled");
        }
        Ok(canceled)
    }

    pub async fn retry_many(&self, job_ids: &[Uuid], org_id: Option<Uuid>) -> JobActionReport {
        let mut report = JobActionReport::default();
        for &job_id in job_ids {
            record(&mut report, job_id, self.retry(job_id, org_id).await);
        }
        report
    }

    pub async fn cancel_many(&self, job_ids: &[Uuid], org_id: Option<Uuid>) -> JobActionReport {
        let mut report = JobActionReport::default();
        for &job_id in job_ids {
            record(&mut report, job_id, self.cancel(job_id, org_id).await);
        }
        report
    }

    /// Oldest `updated_at` a terminal job may have and survive cleanup.
    pub fn cleanup_cutoff(&self) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.config.cleanup_after)
            .unwrap_or_else(|_| chrono::Duration::days(30));
        Utc::now() - retention
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup(&self) -> JobResult<u64> {
        let cutoff = self.cleanup_cutoff();
        let deleted = self.store.cleanup(cutoff).await?;
        info!(deleted, cutoff = %cutoff, "cleaned up old jobs");
        Ok(deleted)
    }

    pub fn derive_dedupe_key(&self, job_type: &str, params: &Value) -> String {
        derive_dedupe_key(job_type, params)
    }
}

fn record(report: &mut JobActionReport, job_id: Uuid, result: JobResult<bool>) {
    match result {
        Ok(true) => report.success_ids.push(job_id),
        Ok(false) => report.failed_ids.push(job_id),
        Err(e) => {
            report.failed_ids.push(job_id);
            report.errors.insert(job_id.to_string(), e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{JobOutcome, JobStore};

    fn org() -> Uuid {
        Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    fn service() -> (Arc<MemoryJobStore>, JobService) {
        let store = Arc::new(MemoryJobStore::new());
        (store.clone(), JobService::new(store))
    }

    fn echo(dedupe_key: &str) -> EnqueueRequest {
        EnqueueRequest::builder()
            .job_type("echo")
            .payload(json!({ "n": 1 }))
            .dedupe_key(dedupe_key)
            .build()
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let (store, service) = service();
        let scope = JobScope::new(org()).with_request_id("req-1");

        let result = service
            .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
            .await
            .unwrap();

        assert!(!result.deduplicated);
        assert_eq!(result.status, JobStatus::Queued);
        let job = store.get(result.job_id).unwrap();
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.org_id, org());
        assert_eq!(job.request_id.as_deref(), Some("req-1"));
        assert!(job.run_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_enqueue_same_dedupe_key_returns_existing() {
        let (store, service) = service();
        let scope = JobScope::new(org());

        let first = service.enqueue(echo("echo-1"), &scope).await.unwrap();
        let second = service.enqueue(echo("echo-1"), &scope).await.unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.job_id, second.job_id);
        let holders = store
            .jobs()
            .into_iter()
            .filter(|j| j.dedupe_key.as_deref() == Some("echo-1"))
            .count();
        assert_eq!(holders, 1);
    }

    #[tokio::test]
    async fn test_succeeded_job_still_holds_dedupe_key() {
        let (store, service) = service();
        let scope = JobScope::new(org());

        let first = service.enqueue(echo("once"), &scope).await.unwrap();
        store.claim("w1", 1).await.unwrap();
        store
            .complete(first.job_id, "w1", JobOutcome::Succeeded { result: None })
            .await
            .unwrap();

        let again = service.enqueue(echo("once"), &scope).await.unwrap();
        assert!(again.deduplicated);
        assert_eq!(again.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_canceled_job_releases_dedupe_key() {
        let (_store, service) = service();
        let scope = JobScope::new(org());

        let first = service.enqueue(echo("k"), &scope).await.unwrap();
        assert!(service.cancel(first.job_id, None).await.unwrap());

        let second = service.enqueue(echo("k"), &scope).await.unwrap();
        assert!(!second.deduplicated);
        assert_ne!(first.job_id, second.job_id);
    }

    #[tokio::test]
    async fn test_repeated_lost_races_still_insert() {
        let (store, service) = service();
        store.inject_dedupe_conflicts(2);

        let result = service
            .enqueue(echo("flapping"), &JobScope::new(org()))
            .await
            .unwrap();

        assert!(!result.deduplicated);
        assert_eq!(store.get(result.job_id).unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_endless_lost_races_give_up_without_dedupe_error() {
        let (store, service) = service();
        store.inject_dedupe_conflicts(10);

        let err = service
            .enqueue(echo("flapping"), &JobScope::new(org()))
            .await
            .unwrap_err();

        assert!(matches!(err, JobError::Internal(_)));
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_collapse_to_one_row() {
        let (store, service) = service();
        let scope = JobScope::new(org());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = service.clone();
            let scope = scope.clone();
            handles.push(tokio::spawn(async move {
                service.enqueue(echo("race"), &scope).await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().job_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_validation() {
        let (store, service) = service();
        let scope = JobScope::new(org());

        let bad = [
            EnqueueRequest::builder().job_type("  ").build(),
            EnqueueRequest::builder().job_type("x".repeat(256)).build(),
            EnqueueRequest::builder().job_type("echo").priority(0i16).build(),
            EnqueueRequest::builder().job_type("echo").priority(11i16).build(),
            EnqueueRequest::builder().job_type("echo").payload(json!([1, 2])).build(),
            EnqueueRequest::builder().job_type("echo").dedupe_key("").build(),
        ];

        for request in bad {
            let err = service.enqueue(request, &scope).await.unwrap_err();
            assert!(matches!(err, JobError::Validation(_)), "{:?}", err);
        }
        assert!(store.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_retry_and_cancel_eligibility() {
        let (store, service) = service();
        let scope = JobScope::new(org());
        let job_id = service
            .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
            .await
            .unwrap()
            .job_id;

        // Queued jobs cannot be retried
        assert!(!service.retry(job_id, None).await.unwrap());

        store.claim("w1", 1).await.unwrap();
        store
            .complete(
                job_id,
                "w1",
                JobOutcome::Deadletter {
                    code: crate::kernel::jobs::ErrorCode::ProcessingError,
                    error: "boom".into(),
                },
            )
            .await
            .unwrap();

        // Deadletter cannot be canceled, only retried
        assert!(!service.cancel(job_id, None).await.unwrap());
        assert!(service.retry(job_id, None).await.unwrap());

        let job = store.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert!(job.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_scoped_get_hides_other_orgs() {
        let (_store, service) = service();
        let result = service
            .enqueue(
                EnqueueRequest::builder().job_type("echo").build(),
                &JobScope::new(org()),
            )
            .await
            .unwrap();

        assert!(service.get(result.job_id, Some(org())).await.unwrap().is_some());
        assert!(service.get(result.job_id, Some(Uuid::nil())).await.unwrap().is_none());
        assert!(!service.cancel(result.job_id, Some(Uuid::nil())).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_cancel_reports_per_id() {
        let (_store, service) = service();
        let scope = JobScope::new(org());
        let a = service
            .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
            .await
            .unwrap()
            .job_id;
        let missing = Uuid::now_v7();

        let report = service.cancel_many(&[a, missing], None).await;

        assert_eq!(report.success_ids, vec![a]);
        assert_eq!(report.failed_ids, vec![missing]);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_list_paginates_newest_first() {
        let (_store, service) = service();
        let scope = JobScope::new(org());
        let mut ids = Vec::new();
        for _ in 0..3 {
            let result = service
                .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
                .await
                .unwrap();
            ids.push(result.job_id);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let page = service
            .list(&JobFilter::for_org(org()), PageArgs::new(2, 0))
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, ids[2]);
        assert!(page.has_more());

        let err = service
            .list(&JobFilter::default(), PageArgs::new(1001, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let store = Arc::new(MemoryJobStore::new());
        let service = JobService::with_config(
            store.clone(),
            JobServiceConfig {
                cleanup_after: Duration::from_secs(3600),
            },
        );
        let scope = JobScope::new(org());
        let old = service
            .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
            .await
            .unwrap()
            .job_id;
        let recent = service
            .enqueue(EnqueueRequest::builder().job_type("echo").build(), &scope)
            .await
            .unwrap()
            .job_id;
        service.cancel(old, None).await.unwrap();
        service.cancel(recent, None).await.unwrap();
        store.backdate_updated_at(old, Duration::from_secs(7200));

        assert_eq!(service.cleanup().await.unwrap(), 1);
        assert!(store.get(recent).is_some());
    }

    #[test]
    fn test_derive_dedupe_key_is_stable() {
        let (_store, service) = service();
        let a = service.derive_dedupe_key("echo", &json!({ "a": 1, "b": 2 }));
        let b = service.derive_dedupe_key("echo", &json!({ "b": 2, "a": 1 }));
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
