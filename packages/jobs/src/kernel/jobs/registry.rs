//! Handler registry for dispatching claimed jobs.
//!
//! The registry maps job type strings (e.g., "maintenance_cleanup") to
//! [`JobHandler`]s. The worker looks the type up after claiming a job; a
//! type with no registration is dead-lettered as `UNKNOWN_JOB_TYPE`.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::job::{Job, JobProgress};
use super::store::JobStore;

/// Executes one job type.
///
/// A handler returns an optional JSON result on success. Returning an error
/// schedules a retry unless the error chain contains
/// [`JobError::Permanent`] (no retry) or [`JobError::Canceled`].
///
/// Delivery is at-least-once, so handlers must tolerate running twice for
/// the same job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Option<Value>>;
}

/// Looks up the handler for a job type.
pub trait HandlerRegistry: Send + Sync {
    fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>>;
}

/// Per-execution context handed to a handler.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub job_type: String,
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub request_id: Option<String>,
    /// 1-based attempt number of this execution
    pub attempt: i32,
    /// Progress recorded by an earlier attempt, if any
    pub previous_progress: Option<JobProgress>,
    cancel: CancellationToken,
    store: Arc<dyn JobStore>,
    worker_id: String,
}

impl JobContext {
    pub fn new(
        job: &Job,
        store: Arc<dyn JobStore>,
        worker_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            org_id: job.org_id,
            user_id: job.user_id,
            request_id: job.request_id.clone(),
            attempt: job.attempts,
            previous_progress: job.parsed_progress(),
            cancel,
            store,
            worker_id: worker_id.into(),
        }
    }

    /// Whether the job was canceled or its ownership was lost.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the job is canceled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Return `Err(JobError::Canceled)` if the job was canceled.
    ///
    /// Call between units of work in long-running handlers.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(JobError::Canceled.into());
        }
        Ok(())
    }

    /// Record progress for this job.
    ///
    /// A rejected write means this worker no longer owns the row (canceled
    /// or recovered elsewhere); the context is canceled in that case.
    pub async fn report_progress(&self, processed: i64, total: i64) -> JobResult<bool> {
        let applied = self
            .store
            .update_progress(
                self.job_id,
                &self.worker_id,
                JobProgress::new(processed, total),
            )
            .await?;

        if !applied {
            debug!(job_id = %self.job_id, "progress rejected, job no longer owned");
            self.cancel.cancel();
        }

        Ok(applied)
    }
}

/// Adapts a typed async closure into a [`JobHandler`].
struct FnHandler<P, F> {
    job_type: &'static str,
    handler: F,
    _payload: PhantomData<fn() -> P>,
}

#[async_trait]
impl<P, F, Fut> JobHandler for FnHandler<P, F>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Option<Value>> {
        let payload: P = serde_json::from_value(payload).map_err(|e| {
            JobError::Permanent(format!("invalid {} payload: {}", self.job_type, e))
        })?;
        (self.handler)(payload, ctx).await
    }
}

/// Registry that maps job type strings to handlers.
///
/// Each component registers its job types at startup, before the worker
/// starts.
///
/// # Example
///
/// ```ignore
/// let mut registry = JobRegistry::new();
///
/// registry.register_fn::<SyncRequest, _, _>("sync_org", |req, ctx| async move {
///     ctx.report_progress(0, req.total).await?;
///     Ok(None)
/// });
/// ```
#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler object for a job type, replacing any existing one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.into(), handler);
    }

    /// Register an async closure taking a typed payload.
    ///
    /// A payload that fails to deserialize is a permanent failure.
    pub fn register_fn<P, F, Fut>(&mut self, job_type: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.register(
            job_type,
            Arc::new(FnHandler {
                job_type,
                handler,
                _payload: PhantomData,
            }),
        );
    }

    /// Check if a job type is registered.
    pub fn is_registered(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Get all registered job types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

impl HandlerRegistry for JobRegistry {
    fn lookup(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    use crate::kernel::jobs::testing::MemoryJobStore;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn registry() -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register_fn::<Greeting, _, _>("greet", |greeting, _ctx| async move {
            Ok(Some(json!({ "hello": greeting.name })))
        });
        registry
    }

    fn context(store: Arc<MemoryJobStore>, job: &Job) -> JobContext {
        JobContext::new(job, store, "worker-test", CancellationToken::new())
    }

    #[test]
    fn test_register_and_check() {
        let registry = registry();

        assert!(registry.is_registered("greet"));
        assert!(!registry.is_registered("unknown_job"));
        assert!(registry.lookup("unknown_job").is_none());
    }

    #[test]
    fn test_registered_types() {
        let mut registry = registry();
        registry.register_fn::<Value, _, _>("audit", |_payload, _ctx| async move { Ok(None) });

        assert_eq!(registry.registered_types(), vec!["audit", "greet"]);
    }

    #[tokio::test]
    async fn test_typed_handler_receives_payload() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::builder().job_type("greet").org_id(Uuid::nil()).build();
        let handler = registry().lookup("greet").unwrap();

        let result = handler
            .handle(context(store, &job), json!({ "name": "ada" }))
            .await
            .unwrap();

        assert_eq!(result, Some(json!({ "hello": "ada" })));
    }

    #[tokio::test]
    async fn test_invalid_payload_is_permanent() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::builder().job_type("greet").org_id(Uuid::nil()).build();
        let handler = registry().lookup("greet").unwrap();

        let err = handler
            .handle(context(store, &job), json!({ "nom": 3 }))
            .await
            .unwrap_err();

        assert!(JobError::is_permanent(&err));
    }

    #[tokio::test]
    async fn test_checkpoint_after_cancel() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::builder().job_type("greet").org_id(Uuid::nil()).build();
        let ctx = context(store, &job);

        assert!(ctx.checkpoint().is_ok());
        ctx.cancel.cancel();
        let err = ctx.checkpoint().unwrap_err();
        assert!(JobError::is_cancellation(&err));
    }

    #[tokio::test]
    async fn test_progress_rejected_when_not_owned() {
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::builder().job_type("greet").org_id(Uuid::nil()).build();
        let ctx = context(store, &job);

        assert!(!ctx.report_progress(1, 10).await.unwrap());
        assert!(ctx.is_canceled());
    }
}
