// Background job queue - core library
//
// Postgres-backed job queue with exclusive claiming, heartbeats, stuck-job
// recovery, deduplicated enqueue, and retry with backoff and deadlettering.
//
// Producers go through kernel::jobs::JobService; job_worker runs JobWorker.

pub mod common;
pub mod config;
pub mod kernel;

pub use config::*;
