//! Job worker service for processing queued jobs.
//!
//! The `JobWorker` is a long-running service that:
//! - Claims ready jobs via `JobStore::claim`, never more than it has free slots
//! - Dispatches each job to its handler via the `HandlerRegistry`
//! - Writes the outcome back (succeeded, retry with backoff, deadletter)
//! - Heartbeats every job it owns, and cancels jobs whose ownership was lost
//! - Requeues jobs whose owner stopped heartbeating
//!
//! # Architecture
//!
//! ```text
//! JobWorker::run
//!     │
//!     ├─► Claim loop: claim(free permits) ─► spawn into JoinSet
//!     │       └─► process_job: lookup ─► handler.handle(ctx) ─► complete(outcome)
//!     ├─► Heartbeat loop: heartbeat(worker_id) ─► cancel tokens of lost jobs
//!     └─► Recovery loop: recover_stuck(now - visibility_timeout)
//! ```
//!
//! On shutdown the claim loop stops, in-flight jobs get `shutdown_timeout` to
//! finish, and whatever is left is aborted and picked up later by recovery.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::error::{JobError, JobResult};
use super::job::{ErrorCode, Job};
use super::registry::{HandlerRegistry, JobContext};
use super::store::{JobOutcome, JobStore, RecoveredJob};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Worker ID recorded in `locked_by`
    pub worker_id: String,
    /// Maximum jobs executing at once
    pub concurrency: usize,
    /// How long to wait when no jobs are available
    pub poll_interval: Duration,
    /// Attempts before a failing job is dead-lettered
    pub max_attempts: i32,
    pub backoff: BackoffPolicy,
    /// Heartbeat age after which a running job is considered abandoned
    pub visibility_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub recovery_interval: Duration,
    /// How long in-flight jobs may run after shutdown is requested
    pub shutdown_timeout: Duration,
    /// Pause after a failed claim
    pub error_backoff: Duration,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
            visibility_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl JobWorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// `{hostname}-{pid}-{short uuid}`
fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

/// A job worker that claims and executes jobs from the store.
#[derive(Clone)]
pub struct JobWorker {
    store: Arc<dyn JobStore>,
    registry: Arc<dyn HandlerRegistry>,
    config: JobWorkerConfig,
    permits: Arc<Semaphore>,
    /// Track running jobs for cancellation
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl JobWorker {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<dyn HandlerRegistry>) -> Self {
        Self::with_config(store, registry, JobWorkerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn JobStore>,
        registry: Arc<dyn HandlerRegistry>,
        config: JobWorkerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            store,
            registry,
            config,
            permits: Arc::new(Semaphore::new(concurrency)),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &JobWorkerConfig {
        &self.config
    }

    /// Ids of jobs currently executing on this worker.
    pub async fn running_jobs(&self) -> Vec<Uuid> {
        self.running.read().await.keys().copied().collect()
    }

    /// Run in the background until [`WorkerHandle::stop`] is called.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.run(shutdown.clone()));
        WorkerHandle { shutdown, handle }
    }

    /// Run the claim, heartbeat, and recovery loops until `shutdown` fires,
    /// then drain in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "job worker starting"
        );

        // Heartbeats must keep going while jobs drain
        let loops = CancellationToken::new();
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(loops.clone()));
        let recovery = tokio::spawn(self.clone().recovery_loop(loops.clone()));

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join_error(joined);
            }

            if shutdown.is_cancelled() {
                break;
            }

            let free = self.permits.available_permits();
            if free == 0 {
                // Full; wake when a slot frees up
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    Some(joined) = tasks.join_next() => log_join_error(joined),
                }
                continue;
            }

            let jobs = match self.store.claim(&self.config.worker_id, free as i64).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "dispatching claimed jobs");

            for job in jobs {
                let permit = self.permits.clone().acquire_owned().await?;
                let cancel = self.track(job.id).await;
                let worker = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    worker.process_job(job, cancel).await;
                });
            }
        }

        self.drain(&mut tasks).await;

        loops.cancel();
        let _ = heartbeat.await;
        let _ = recovery.await;

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Claim one batch and execute it to completion.
    ///
    /// Shares the concurrency permits with [`run`](Self::run) on any clone of
    /// this worker, so the batch is at most the number of free slots. Returns
    /// the number of jobs processed.
    pub async fn run_once(&self) -> JobResult<usize> {
        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(0);
        }
        let permits = self
            .permits
            .clone()
            .acquire_many_owned(free as u32)
            .await
            .map_err(|e| JobError::Internal(e.into()))?;

        let jobs = self.store.claim(&self.config.worker_id, free as i64).await?;
        let count = jobs.len();

        let mut handles = Vec::with_capacity(count);
        for job in jobs {
            let cancel = self.track(job.id).await;
            handles.push(self.process_job(job, cancel));
        }
        futures::future::join_all(handles).await;
        drop(permits);

        Ok(count)
    }

    /// Refresh heartbeats and cancel in-flight jobs this worker no longer owns.
    ///
    /// Returns the number of jobs whose cancellation was triggered.
    pub async fn heartbeat_once(&self) -> JobResult<usize> {
        // Only jobs tracked before the heartbeat query can be judged by its result
        let tracked: Vec<Uuid> = self.running.read().await.keys().copied().collect();

        let owned: HashSet<Uuid> = self
            .store
            .heartbeat(&self.config.worker_id)
            .await?
            .into_iter()
            .collect();

        let running = self.running.read().await;
        let mut lost = 0;
        for job_id in tracked.iter().filter(|id| !owned.contains(id)) {
            let Some(token) = running.get(job_id) else {
                continue;
            };
            if !token.is_cancelled() {
                warn!(
                    job_id = %job_id,
                    worker_id = %self.config.worker_id,
                    "job no longer owned, signalling cancellation"
                );
                token.cancel();
                lost += 1;
            }
        }

        Ok(lost)
    }

    /// Requeue (or dead-letter) running jobs whose heartbeat is older than
    /// the visibility timeout.
    pub async fn recover_once(&self) -> JobResult<Vec<RecoveredJob>> {
        let timeout = chrono::Duration::from_std(self.config.visibility_timeout)
            .map_err(|e| JobError::Internal(e.into()))?;
        let stale_before = Utc::now() - timeout;

        let recovered = self
            .store
            .recover_stuck(stale_before, self.config.max_attempts)
            .await?;

        for job in &recovered {
            warn!(
                job_id = %job.id,
                status = %job.status,
                attempts = job.attempts,
                previous_owner = job.previous_owner.as_deref().unwrap_or("unknown"),
                "recovered stuck job"
            );
        }

        Ok(recovered)
    }

    async fn heartbeat_loop(self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.heartbeat_once().await {
                        warn!(worker_id = %self.config.worker_id, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn recovery_loop(self, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.recovery_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.recover_once().await {
                        error!(error = %e, "stuck job recovery failed");
                    }
                }
            }
        }
    }

    /// Register a job as running and hand out its cancellation token.
    async fn track(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.running.write().await.insert(job_id, token.clone());
        token
    }

    /// Execute a single claimed job and record its outcome.
    async fn process_job(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id;

        let Some(handler) = self.registry.lookup(&job.job_type) else {
            error!(job_id = %job_id, job_type = %job.job_type, "no handler registered for job type");
            let outcome = JobOutcome::Deadletter {
                code: ErrorCode::UnknownJobType,
                error: JobError::UnknownType(job.job_type.clone()).to_string(),
            };
            self.finish(&job, outcome).await;
            self.running.write().await.remove(&job_id);
            return;
        };

        debug!(
            job_id = %job_id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "executing job"
        );

        let ctx = JobContext::new(&job, self.store.clone(), &self.config.worker_id, cancel.clone());
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(ctx, job.payload.clone()))
            .catch_unwind()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(result)) => {
                info!(job_id = %job_id, job_type = %job.job_type, elapsed_ms, "job succeeded");
                JobOutcome::Succeeded { result }
            }
            Ok(Err(e)) if JobError::is_cancellation(&e) || cancel.is_cancelled() => {
                info!(job_id = %job_id, job_type = %job.job_type, "job canceled");
                JobOutcome::Canceled
            }
            Ok(Err(e)) if JobError::is_permanent(&e) => {
                error!(job_id = %job_id, job_type = %job.job_type, error = %e, "job failed permanently");
                JobOutcome::Failed {
                    code: ErrorCode::ProcessingError,
                    error: format!("{:#}", e),
                }
            }
            Ok(Err(e)) => self.retry_or_deadletter(&job, format!("{:#}", e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job_id, job_type = %job.job_type, panic = %message, "job handler panicked");
                self.retry_or_deadletter(&job, format!("handler panicked: {}", message))
            }
        };

        self.finish(&job, outcome).await;
        self.running.write().await.remove(&job_id);
    }

    fn retry_or_deadletter(&self, job: &Job, error: String) -> JobOutcome {
        if job.attempts >= self.config.max_attempts {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempts = job.attempts,
                error = %error,
                "job exhausted retries, moving to deadletter"
            );
            return JobOutcome::Deadletter {
                code: ErrorCode::ProcessingError,
                error,
            };
        }

        let delay = self.config.backoff.delay_for(job.attempts);
        let run_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "job failed, retry scheduled"
        );

        JobOutcome::Retry { run_at, error }
    }

    async fn finish(&self, job: &Job, outcome: JobOutcome) {
        let status = outcome.status();
        match self.store.complete(job.id, &self.config.worker_id, outcome).await {
            Ok(true) => debug!(job_id = %job.id, status = %status, "job outcome recorded"),
            Ok(false) => info!(
                job_id = %job.id,
                status = %status,
                "job no longer owned by this worker, outcome discarded"
            ),
            Err(e) => error!(job_id = %job.id, error = %e, "failed to record job outcome"),
        }
    }

    /// Wait for in-flight jobs, then abort whatever outlives the timeout.
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        info!(count = tasks.len(), "waiting for running jobs to complete");

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                log_join_error(joined);
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = self.running_jobs().await;
            warn!(
                count = abandoned.len(),
                "shutdown timeout reached, aborting jobs; recovery will requeue them"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            self.running.write().await.clear();
        }
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!(error = %e, "job task failed");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A worker running on the Tokio runtime.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Request a graceful shutdown.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> Result<()> {
        self.handle.await?
    }

    /// Stop and wait.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        self.join().await
    }
}
