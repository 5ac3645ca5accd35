//! Built-in job handlers.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::JobError;
use super::registry::{JobContext, JobHandler, JobRegistry};
use super::service::JobService;

pub const ECHO_JOB: &str = "echo";
pub const MAINTENANCE_CLEANUP_JOB: &str = "maintenance_cleanup";

const CLEANUP_JOBS_TASK: &str = "cleanup_jobs";

/// Register the built-in handlers.
pub fn register_builtin_handlers(registry: &mut JobRegistry, service: JobService) {
    registry.register(ECHO_JOB, std::sync::Arc::new(EchoHandler));
    registry.register(
        MAINTENANCE_CLEANUP_JOB,
        std::sync::Arc::new(MaintenanceCleanupHandler::new(service)),
    );
}

/// Returns its payload as the result. Used for smoke tests.
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Option<Value>> {
        ctx.checkpoint()?;
        Ok(Some(payload))
    }
}

#[derive(Debug, Deserialize)]
struct MaintenancePayload {
    #[serde(default = "default_tasks")]
    tasks: Vec<String>,
    #[serde(default)]
    dry_run: bool,
}

fn default_tasks() -> Vec<String> {
    vec![CLEANUP_JOBS_TASK.to_string()]
}

/// Runs periodic maintenance tasks.
///
/// Payload: `{"tasks": ["cleanup_jobs"], "dry_run": false}`, both optional.
pub struct MaintenanceCleanupHandler {
    service: JobService,
}

impl MaintenanceCleanupHandler {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobHandler for MaintenanceCleanupHandler {
    async fn handle(&self, ctx: JobContext, payload: Value) -> Result<Option<Value>> {
        let payload: MaintenancePayload = serde_json::from_value(payload)
            .map_err(|e| JobError::Permanent(format!("invalid maintenance payload: {}", e)))?;

        info!(
            job_id = %ctx.job_id,
            tasks = ?payload.tasks,
            dry_run = payload.dry_run,
            "starting maintenance tasks"
        );

        let mut results = BTreeMap::new();
        for task in &payload.tasks {
            ctx.checkpoint()?;

            let outcome = match task.as_str() {
                CLEANUP_JOBS_TASK if payload.dry_run => json!({
                    "status": "dry_run",
                    "cutoff": self.service.cleanup_cutoff(),
                }),
                CLEANUP_JOBS_TASK => {
                    let deleted = self.service.cleanup().await?;
                    json!({ "status": "completed", "deleted_count": deleted })
                }
                other => {
                    warn!(task = %other, "unknown maintenance task, skipping");
                    json!({ "status": "skipped", "reason": "unknown_task" })
                }
            };
            results.insert(task.clone(), outcome);
        }

        Ok(Some(json!({
            "status": "completed",
            "tasks_processed": payload.tasks,
            "dry_run": payload.dry_run,
            "results": results,
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::kernel::jobs::testing::MemoryJobStore;
    use crate::kernel::jobs::{HandlerRegistry, Job, JobStore};

    fn setup() -> (Arc<MemoryJobStore>, JobRegistry) {
        let store = Arc::new(MemoryJobStore::new());
        let mut registry = JobRegistry::new();
        register_builtin_handlers(&mut registry, JobService::new(store.clone()));
        (store, registry)
    }

    fn context(store: Arc<MemoryJobStore>, job_type: &str) -> JobContext {
        let job = Job::builder().job_type(job_type).org_id(Uuid::nil()).build();
        JobContext::new(&job, store, "worker-test", CancellationToken::new())
    }

    #[test]
    fn test_builtins_registered() {
        let (_store, registry) = setup();
        assert_eq!(
            registry.registered_types(),
            vec![ECHO_JOB, MAINTENANCE_CLEANUP_JOB]
        );
    }

    #[tokio::test]
    async fn test_echo_returns_payload() {
        let (store, registry) = setup();
        let handler = registry.lookup(ECHO_JOB).unwrap();

        let result = handler
            .handle(context(store, ECHO_JOB), json!({ "n": 1 }))
            .await
            .unwrap();

        assert_eq!(result, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_maintenance_dry_run_deletes_nothing() {
        let (store, registry) = setup();
        let old = store
            .insert(Job::builder().job_type("echo").org_id(Uuid::nil()).build())
            .await
            .unwrap();
        store.cancel(old.id, None).await.unwrap();
        store.backdate_updated_at(old.id, Duration::from_secs(86_400 * 60));
        let handler = registry.lookup(MAINTENANCE_CLEANUP_JOB).unwrap();

        let result = handler
            .handle(
                context(store.clone(), MAINTENANCE_CLEANUP_JOB),
                json!({ "dry_run": true }),
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result["results"]["cleanup_jobs"]["status"], "dry_run");
        assert!(store.get(old.id).is_some());

        let result = handler
            .handle(context(store.clone(), MAINTENANCE_CLEANUP_JOB), json!({}))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result["results"]["cleanup_jobs"]["deleted_count"], 1);
        assert!(store.get(old.id).is_none());
    }

    #[tokio::test]
    async fn test_maintenance_rejects_malformed_payload() {
        let (store, registry) = setup();
        let handler = registry.lookup(MAINTENANCE_CLEANUP_JOB).unwrap();

        let err = handler
            .handle(
                context(store, MAINTENANCE_CLEANUP_JOB),
                json!({ "tasks": "cleanup_jobs" }),
            )
            .await
            .unwrap_err();

        assert!(JobError::is_permanent(&err));
    }
}
