//! Manager configuration: builders, validation, and environment loading.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Root configuration for [`crate::TaskManager`].
///
/// Defaults mirror a single-host deployment: in-memory queue fallback when
/// no Redis URL is configured, throttle at 90% CPU / 85% memory, at most 8
/// workers preferred and 12 absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Redis connection URL for the shared queue; `None` selects the
    /// in-process fallback directly.
    pub redis_url: Option<String>,
    /// Key namespace for all queue state in Redis.
    pub queue_namespace: String,
    /// SQLite database path; `None` selects an in-memory store.
    pub db_path: Option<PathBuf>,
    /// Absolute upper bound on the worker pool, autoscaling included.
    pub max_workers: usize,
    /// Preferred cap used by the sizing rule under normal load.
    pub preferred_max_workers: usize,
    /// CPU percentage above which workers idle instead of dequeuing.
    pub cpu_throttle_threshold: f64,
    /// Memory percentage above which workers idle instead of dequeuing.
    pub memory_throttle_threshold: f64,
    /// CPU percentage above which the sizing rule halves the core count.
    pub cpu_scale_threshold: f64,
    /// Memory percentage above which the sizing rule thirds the core count.
    pub memory_scale_threshold: f64,
    /// How long a worker blocks on an empty queue per dequeue attempt.
    pub poll_timeout: Duration,
    /// How long a throttled worker sleeps before re-checking.
    pub throttle_pause: Duration,
    /// Linear backoff unit: a retried task becomes eligible after
    /// `retry_backoff * retry_count`.
    pub retry_backoff: Duration,
    /// TTL for entries in the queue's transient result cache.
    pub result_ttl: Duration,
    /// TTL for task payloads held by the Redis backend.
    pub payload_ttl: Duration,
    /// Period of the autoscaling loop.
    pub autoscale_interval: Duration,
    /// Period of the metrics-collection loop.
    pub metrics_interval: Duration,
    /// Recent window for dashboard throughput and averages.
    pub stats_window: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_namespace: "taskmill".into(),
            db_path: Some(PathBuf::from("taskmill.db")),
            max_workers: 12,
            preferred_max_workers: 8,
            cpu_throttle_threshold: 90.0,
            memory_throttle_threshold: 85.0,
            cpu_scale_threshold: 80.0,
            memory_scale_threshold: 75.0,
            poll_timeout: Duration::from_secs(10),
            throttle_pause: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(30),
            result_ttl: Duration::from_secs(3600),
            payload_ttl: Duration::from_secs(3600),
            autoscale_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(60),
            stats_window: Duration::from_secs(3600),
        }
    }
}

impl ManagerConfig {
    /// Set the Redis URL for the shared queue.
    #[must_use]
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the SQLite database path.
    #[must_use]
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Use an in-memory persistence store (tests, throwaway runs).
    #[must_use]
    pub fn with_in_memory_store(mut self) -> Self {
        self.db_path = None;
        self
    }

    /// Set the absolute worker-pool bound.
    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the preferred worker cap for the sizing rule.
    #[must_use]
    pub const fn with_preferred_max_workers(mut self, preferred: usize) -> Self {
        self.preferred_max_workers = preferred;
        self
    }

    /// Set the throttle thresholds (CPU, memory) in percent.
    #[must_use]
    pub const fn with_throttle_thresholds(mut self, cpu: f64, memory: f64) -> Self {
        self.cpu_throttle_threshold = cpu;
        self.memory_throttle_threshold = memory;
        self
    }

    /// Set how long a worker blocks on an empty queue per attempt.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the throttled-worker pause.
    #[must_use]
    pub const fn with_throttle_pause(mut self, pause: Duration) -> Self {
        self.throttle_pause = pause;
        self
    }

    /// Set the linear backoff unit for retries.
    #[must_use]
    pub const fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the autoscale and metrics loop periods.
    #[must_use]
    pub const fn with_loop_intervals(mut self, autoscale: Duration, metrics: Duration) -> Self {
        self.autoscale_interval = autoscale;
        self.metrics_interval = metrics;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "max_workers must be greater than 0".into(),
            ));
        }
        if self.preferred_max_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "preferred_max_workers must be greater than 0".into(),
            ));
        }
        if self.preferred_max_workers > self.max_workers {
            return Err(SchedulerError::InvalidConfig(
                "preferred_max_workers must not exceed max_workers".into(),
            ));
        }
        for (name, value) in [
            ("cpu_throttle_threshold", self.cpu_throttle_threshold),
            ("memory_throttle_threshold", self.memory_throttle_threshold),
            ("cpu_scale_threshold", self.cpu_scale_threshold),
            ("memory_scale_threshold", self.memory_scale_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be within 0..=100"
                )));
            }
        }
        if self.queue_namespace.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "queue_namespace must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("poll_timeout", self.poll_timeout),
            ("autoscale_interval", self.autoscale_interval),
            ("metrics_interval", self.metrics_interval),
            ("stats_window", self.stats_window),
        ] {
            if value.is_zero() {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from the environment, on top of the defaults.
    ///
    /// Reads `TASKMILL_REDIS_URL`, `TASKMILL_DB_PATH`,
    /// `TASKMILL_QUEUE_NAMESPACE`, and `TASKMILL_MAX_WORKERS`. A `.env`
    /// file is honored when present.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidConfig`] when a variable fails to
    /// parse or the resulting configuration is invalid.
    pub fn from_env() -> Result<Self, SchedulerError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(url) = env::var("TASKMILL_REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }
        if let Ok(path) = env::var("TASKMILL_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(namespace) = env::var("TASKMILL_QUEUE_NAMESPACE") {
            if !namespace.is_empty() {
                config.queue_namespace = namespace;
            }
        }
        if let Ok(raw) = env::var("TASKMILL_MAX_WORKERS") {
            config.max_workers = raw.parse().map_err(|e| {
                SchedulerError::InvalidConfig(format!("TASKMILL_MAX_WORKERS: {e}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = ManagerConfig::default().with_max_workers(0);
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn preferred_cap_must_fit_the_bound() {
        let config = ManagerConfig::default()
            .with_max_workers(4)
            .with_preferred_max_workers(8);
        assert!(config.validate().is_err());
    }

    #[test]
    fn thresholds_must_be_percentages() {
        let config = ManagerConfig::default().with_throttle_thresholds(150.0, 85.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn builders_compose() {
        let config = ManagerConfig::default()
            .with_redis_url("redis://127.0.0.1:6379")
            .with_in_memory_store()
            .with_max_workers(6)
            .with_preferred_max_workers(4)
            .with_retry_backoff(Duration::from_secs(5));
        assert!(config.validate().is_ok());
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert!(config.db_path.is_none());
        assert_eq!(config.retry_backoff, Duration::from_secs(5));
    }
}
