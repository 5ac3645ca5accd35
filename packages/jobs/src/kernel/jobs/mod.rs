//! Job infrastructure for background execution.
//!
//! This module provides the kernel-level infrastructure for job execution:
//! - [`JobService`] - Enqueue (with dedupe), query, retry, cancel, cleanup
//! - [`JobStore`] - Persistence seam, [`PostgresJobStore`] in production
//! - [`JobWorker`] - Long-running service that claims and executes jobs
//! - [`JobRegistry`] - Maps job type strings to [`JobHandler`]s
//! - [`Job`] - Job model and status transition rules
//!
//! # Architecture
//!
//! ```text
//! Producer calls JobService::enqueue(request, scope)
//!     │
//!     └─► Dedupe check ─► INSERT (unique violation = someone else won)
//!
//! JobWorker
//!     │
//!     ├─► Claim loop: SELECT ... FOR UPDATE SKIP LOCKED, flip to running
//!     ├─► Dispatch: JobRegistry.lookup(type) ─► JobHandler.handle(ctx, payload)
//!     ├─► Outcome: succeeded | queued (backoff) | deadletter | canceled
//!     ├─► Heartbeat loop: heartbeat_at = NOW() for owned rows
//!     └─► Recovery loop: stale heartbeats ─► queued (WORKER_TIMEOUT)
//! ```
//!
//! Delivery is at-least-once: a job whose worker dies mid-run is requeued
//! by whichever worker notices the stale heartbeat, so handlers must
//! tolerate re-execution.

mod backoff;
mod error;
pub mod handlers;
mod job;
mod job_store;
mod registry;
mod service;
mod store;
pub mod testing;
mod worker;

pub use backoff::BackoffPolicy;
pub use error::{JobError, JobResult};
pub use job::{ErrorCode, Job, JobProgress, JobStatus, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY};
pub use job_store::PostgresJobStore;
pub use registry::{HandlerRegistry, JobContext, JobHandler, JobRegistry};
pub use service::{
    EnqueueRequest, EnqueueResult, JobActionReport, JobScope, JobService, JobServiceConfig,
};
pub use store::{JobFilter, JobOutcome, JobStats, JobStore, RecoveredJob};
pub use testing::MemoryJobStore;
pub use worker::{JobWorker, JobWorkerConfig, WorkerHandle};
