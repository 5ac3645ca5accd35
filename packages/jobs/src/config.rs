use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::kernel::jobs::{BackoffPolicy, JobServiceConfig, JobWorkerConfig};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub worker_id: Option<String>,
    pub job_concurrency: usize,
    pub job_poll_interval_ms: u64,
    pub job_backoff_base_ms: u64,
    pub job_max_backoff_s: u64,
    pub job_max_attempts: i32,
    pub job_visibility_timeout_s: u64,
    pub job_heartbeat_interval_s: u64,
    pub job_recovery_interval_s: u64,
    pub job_shutdown_timeout_s: u64,
    pub job_cleanup_after_days: u32,
    pub job_cleanup_cron: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            worker_id: lookup("WORKER_ID").filter(|id| !id.trim().is_empty()),
            job_concurrency: parse_or(&lookup, "JOB_CONCURRENCY", 4)?,
            job_poll_interval_ms: parse_or(&lookup, "JOB_POLL_INTERVAL_MS", 1_000)?,
            job_backoff_base_ms: parse_or(&lookup, "JOB_BACKOFF_BASE_MS", 1_000)?,
            job_max_backoff_s: parse_or(&lookup, "JOB_MAX_BACKOFF_S", 300)?,
            job_max_attempts: parse_or(&lookup, "JOB_MAX_ATTEMPTS", 5)?,
            job_visibility_timeout_s: parse_or(&lookup, "JOB_VISIBILITY_TIMEOUT_S", 300)?,
            job_heartbeat_interval_s: parse_or(&lookup, "JOB_HEARTBEAT_INTERVAL_S", 30)?,
            job_recovery_interval_s: parse_or(&lookup, "JOB_RECOVERY_INTERVAL_S", 300)?,
            job_shutdown_timeout_s: parse_or(&lookup, "JOB_SHUTDOWN_TIMEOUT_S", 30)?,
            job_cleanup_after_days: parse_or(&lookup, "JOB_CLEANUP_AFTER_DAYS", 30)?,
            job_cleanup_cron: lookup("JOB_CLEANUP_CRON")
                .unwrap_or_else(|| "0 0 3 * * *".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.job_concurrency == 0 {
            bail!("JOB_CONCURRENCY must be at least 1");
        }
        if self.job_max_attempts < 1 {
            bail!("JOB_MAX_ATTEMPTS must be at least 1");
        }
        if self.job_poll_interval_ms == 0 {
            bail!("JOB_POLL_INTERVAL_MS must be greater than 0");
        }
        if self.job_heartbeat_interval_s == 0 || self.job_recovery_interval_s == 0 {
            bail!("heartbeat and recovery intervals must be greater than 0");
        }
        if self.job_heartbeat_interval_s >= self.job_visibility_timeout_s {
            bail!(
                "JOB_HEARTBEAT_INTERVAL_S ({}) must be shorter than JOB_VISIBILITY_TIMEOUT_S ({})",
                self.job_heartbeat_interval_s,
                self.job_visibility_timeout_s
            );
        }
        Ok(())
    }

    /// Worker settings derived from this configuration.
    pub fn worker_config(&self) -> JobWorkerConfig {
        let mut config = match &self.worker_id {
            Some(id) => JobWorkerConfig::with_worker_id(id.clone()),
            None => JobWorkerConfig::default(),
        };

        config.concurrency = self.job_concurrency;
        config.poll_interval = Duration::from_millis(self.job_poll_interval_ms);
        config.max_attempts = self.job_max_attempts;
        config.backoff = BackoffPolicy::new(
            Duration::from_millis(self.job_backoff_base_ms),
            Duration::from_secs(self.job_max_backoff_s),
        );
        config.visibility_timeout = Duration::from_secs(self.job_visibility_timeout_s);
        config.heartbeat_interval = Duration::from_secs(self.job_heartbeat_interval_s);
        config.recovery_interval = Duration::from_secs(self.job_recovery_interval_s);
        config.shutdown_timeout = Duration::from_secs(self.job_shutdown_timeout_s);
        config
    }

    /// Service settings derived from this configuration.
    pub fn service_config(&self) -> JobServiceConfig {
        JobServiceConfig {
            cleanup_after: Duration::from_secs(u64::from(self.job_cleanup_after_days) * 24 * 3600),
        }
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://db")])).unwrap();

        assert_eq!(config.job_concurrency, 4);
        assert_eq!(config.job_max_attempts, 5);
        assert_eq!(config.job_visibility_timeout_s, 300);
        assert_eq!(config.job_cleanup_cron, "0 0 3 * * *");
        assert!(config.worker_id.is_none());
    }

    #[test]
    fn test_database_url_required() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_invalid_number_rejected() {
        let err = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://db"),
            ("JOB_CONCURRENCY", "many"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("JOB_CONCURRENCY"));
    }

    #[test]
    fn test_heartbeat_must_be_shorter_than_visibility_timeout() {
        let result = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://db"),
            ("JOB_HEARTBEAT_INTERVAL_S", "60"),
            ("JOB_VISIBILITY_TIMEOUT_S", "60"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_worker_config_mapping() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://db"),
            ("WORKER_ID", "worker-a"),
            ("JOB_CONCURRENCY", "8"),
            ("JOB_POLL_INTERVAL_MS", "250"),
            ("JOB_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        let worker = config.worker_config();
        assert_eq!(worker.worker_id, "worker-a");
        assert_eq!(worker.concurrency, 8);
        assert_eq!(worker.poll_interval, Duration::from_millis(250));
        assert_eq!(worker.max_attempts, 3);
        assert_eq!(worker.visibility_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_service_config_retention() {
        let config = Config::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://db"),
            ("JOB_CLEANUP_AFTER_DAYS", "2"),
        ]))
        .unwrap();

        assert_eq!(
            config.service_config().cleanup_after,
            Duration::from_secs(2 * 24 * 3600)
        );
    }
}
