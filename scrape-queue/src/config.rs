//! System configuration.
//!
//! Every option has a default matching the production deployment; any of them
//! can be overridden through `SCRAPE_*` environment variables:
//!
//! ```bash
//! export SCRAPE_WORKER_COUNT=8
//! export SCRAPE_REFRESH_INTERVAL_MINUTES=120
//! export SCRAPE_REDIS_URL=redis://localhost:6379
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{QueueError, QueueResult};

/// Queue behaviour: leases, retries and priority scaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease duration for every dequeued job
    pub lease_minutes: u64,
    /// Failed attempts allowed before a job is dead-lettered
    pub max_retries: u32,
    /// Backoff base: delay for attempt n is base * 2^n
    pub retry_base_seconds: u64,
    /// Backoff ceiling
    pub retry_cap_seconds: u64,
    /// Milliseconds of dispatch delay per priority point
    pub priority_unit_ms: i64,
    /// Redis URL; the in-memory backend is used when unset
    pub redis_url: Option<String>,
    /// Key namespace for the Redis backend
    pub redis_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_minutes: 30,
            max_retries: 3,
            retry_base_seconds: 30,
            retry_cap_seconds: 300, // 5 minutes
            priority_unit_ms: 1000,
            redis_url: None,
            redis_prefix: "tiktrack:scrape".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_minutes * 60)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_secs(self.retry_base_seconds)
    }

    pub fn retry_cap(&self) -> Duration {
        Duration::from_secs(self.retry_cap_seconds)
    }
}

/// Scheduler timers and the staleness threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub check_interval_minutes: u64,
    pub maintenance_interval_minutes: u64,
    /// A profile is due once its last scrape is older than this
    pub refresh_interval_minutes: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: 10,
            maintenance_interval_minutes: 5,
            refresh_interval_minutes: 150, // 2h30m
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_minutes * 60)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_minutes * 60)
    }
}

/// Worker pool sizing and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Idle wait when the queue is empty
    pub poll_interval_ms: u64,
    /// Anti-burst delay range before each scrape
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    /// Pause between consecutive jobs
    pub inter_job_delay_ms: u64,
    /// Cooldown after an unexpected failure in the loop
    pub recovery_delay_ms: u64,
    /// Delay between spawning consecutive workers
    pub spawn_stagger_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            poll_interval_ms: 5_000,
            jitter_min_ms: 5_000,
            jitter_max_ms: 15_000,
            inter_job_delay_ms: 2_000,
            recovery_delay_ms: 10_000,
            spawn_stagger_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inter_job_delay(&self) -> Duration {
        Duration::from_millis(self.inter_job_delay_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn spawn_stagger(&self) -> Duration {
        Duration::from_millis(self.spawn_stagger_ms)
    }

    /// Near-zero delays for tests and local runs
    pub fn immediate(worker_count: usize) -> Self {
        Self {
            worker_count,
            poll_interval_ms: 10,
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            inter_job_delay_ms: 0,
            recovery_delay_ms: 10,
            spawn_stagger_ms: 0,
        }
    }
}

/// Complete configuration for the scraping system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub workers: WorkerConfig,
    /// Interval of the aggregate status report
    pub status_report_minutes: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            workers: WorkerConfig::default(),
            status_report_minutes: 30,
        }
    }
}

impl SystemConfig {
    /// Load configuration from `SCRAPE_*` environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue = QueueConfig {
            lease_minutes: env_or("SCRAPE_LEASE_MINUTES", defaults.queue.lease_minutes),
            max_retries: env_or("SCRAPE_MAX_RETRIES", defaults.queue.max_retries),
            retry_base_seconds: env_or("SCRAPE_RETRY_BASE_SECONDS", defaults.queue.retry_base_seconds),
            retry_cap_seconds: env_or("SCRAPE_RETRY_CAP_SECONDS", defaults.queue.retry_cap_seconds),
            priority_unit_ms: env_or("SCRAPE_PRIORITY_UNIT_MS", defaults.queue.priority_unit_ms),
            redis_url: env::var("SCRAPE_REDIS_URL").ok().filter(|url| !url.is_empty()),
            redis_prefix: env::var("SCRAPE_REDIS_PREFIX").unwrap_or(defaults.queue.redis_prefix),
        };

        let scheduler = SchedulerConfig {
            check_interval_minutes: env_or("SCRAPE_CHECK_INTERVAL_MINUTES", defaults.scheduler.check_interval_minutes),
            maintenance_interval_minutes: env_or(
                "SCRAPE_MAINTENANCE_INTERVAL_MINUTES",
                defaults.scheduler.maintenance_interval_minutes,
            ),
            refresh_interval_minutes: env_or(
                "SCRAPE_REFRESH_INTERVAL_MINUTES",
                defaults.scheduler.refresh_interval_minutes,
            ),
        };

        let workers = WorkerConfig {
            worker_count: env_or("SCRAPE_WORKER_COUNT", defaults.workers.worker_count),
            poll_interval_ms: env_or("SCRAPE_POLL_INTERVAL_MS", defaults.workers.poll_interval_ms),
            jitter_min_ms: env_or("SCRAPE_JITTER_MIN_MS", defaults.workers.jitter_min_ms),
            jitter_max_ms: env_or("SCRAPE_JITTER_MAX_MS", defaults.workers.jitter_max_ms),
            inter_job_delay_ms: env_or("SCRAPE_INTER_JOB_DELAY_MS", defaults.workers.inter_job_delay_ms),
            recovery_delay_ms: env_or("SCRAPE_RECOVERY_DELAY_MS", defaults.workers.recovery_delay_ms),
            spawn_stagger_ms: env_or("SCRAPE_SPAWN_STAGGER_MS", defaults.workers.spawn_stagger_ms),
        };

        Self {
            queue,
            scheduler,
            workers,
            status_report_minutes: env_or("SCRAPE_STATUS_REPORT_MINUTES", defaults.status_report_minutes),
        }
    }

    pub fn status_report_interval(&self) -> Duration {
        Duration::from_secs(self.status_report_minutes.max(1) * 60)
    }

    /// Reject configurations the system cannot run with
    pub fn validate(&self) -> QueueResult<()> {
        if self.workers.worker_count == 0 {
            return Err(QueueError::Config("worker_count must be at least 1".to_string()));
        }
        if self.workers.jitter_min_ms > self.workers.jitter_max_ms {
            return Err(QueueError::Config(format!(
                "jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.workers.jitter_min_ms, self.workers.jitter_max_ms
            )));
        }
        if self.queue.max_retries == 0 {
            return Err(QueueError::Config("max_retries must be at least 1".to_string()));
        }
        if self.queue.lease_minutes == 0 {
            return Err(QueueError::Config("lease_minutes must be at least 1".to_string()));
        }
        if self.scheduler.check_interval_minutes == 0 || self.scheduler.maintenance_interval_minutes == 0 {
            return Err(QueueError::Config("scheduler intervals must be at least 1 minute".to_string()));
        }
        Ok(())
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_deployment() {
        let config = SystemConfig::default();

        assert_eq!(config.workers.worker_count, 4);
        assert_eq!(config.scheduler.check_interval_minutes, 10);
        assert_eq!(config.scheduler.maintenance_interval_minutes, 5);
        assert_eq!(config.scheduler.refresh_interval_minutes, 150);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.lease_duration(), Duration::from_secs(30 * 60));
        assert_eq!(config.status_report_interval(), Duration::from_secs(30 * 60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        env::set_var("SCRAPE_WORKER_COUNT", "7");
        env::set_var("SCRAPE_REFRESH_INTERVAL_MINUTES", "not-a-number");

        let config = SystemConfig::from_env();

        env::remove_var("SCRAPE_WORKER_COUNT");
        env::remove_var("SCRAPE_REFRESH_INTERVAL_MINUTES");

        assert_eq!(config.workers.worker_count, 7);
        assert_eq!(config.scheduler.refresh_interval_minutes, 150);
    }

    #[test]
    fn test_validate_rejects_inverted_jitter() {
        let mut config = SystemConfig::default();
        config.workers.jitter_min_ms = 20;
        config.workers.jitter_max_ms = 10;

        assert!(matches!(config.validate(), Err(QueueError::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SystemConfig =
            serde_json::from_str(r#"{"workers": {"worker_count": 2}, "queue": {"max_retries": 5}}"#).unwrap();

        assert_eq!(config.workers.worker_count, 2);
        assert_eq!(config.workers.inter_job_delay_ms, 2_000);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.lease_minutes, 30);
    }
}
