//! Shared priority work queue for profile scrape jobs.
//!
//! [`JobQueue`] owns the retry and lease policy on top of a [`QueueBackend`]
//! that only provides atomic lane primitives. Backend failures never escape:
//! they are logged and mapped to `false`, `None`, `0` or zeroed stats.

use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, QueueConfig, Job, DeadLetter, FailureRoute, QueueStats, Lane,
    JobEvent, backend::QueueBackend,
    observability::{MetricsSnapshot, ObservabilityLayer},
};

/// Error recorded for jobs whose lease expired before they were reported
pub const STUCK_JOB_ERROR: &str = "Job stuck in processing queue";

/// Backoff before attempt `attempts + 1`: `min(cap, base * 2^attempts)`
pub fn retry_backoff(attempts: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// How a failed attempt is routed: retry with capped backoff while
/// `attempts < max_retries`, otherwise dead-letter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    /// Record the failure on `job` and decide its next lane
    pub fn route(&self, mut job: Job, error: &str, now: DateTime<Utc>) -> FailureRoute {
        job.record_failure(error);

        if job.can_retry(self.max_retries) {
            let delay = retry_backoff(job.attempts, self.base, self.cap);
            FailureRoute::Retry {
                retry_at: now + chrono_span(delay),
                job,
            }
        } else {
            FailureRoute::Dead(DeadLetter::from_job(&job, now))
        }
    }
}

/// Cheaply cloneable handle to the shared queue
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    observability: ObservabilityLayer,
}

impl JobQueue {
    /// Create a queue over any backend
    pub fn new<B: QueueBackend + 'static>(backend: B, config: QueueConfig) -> Self {
        Self::from_backend(Arc::new(backend), config)
    }

    /// Create a queue over a shared backend handle
    pub fn from_backend(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        Self {
            backend,
            config,
            observability: ObservabilityLayer::new(),
        }
    }

    /// In-process queue
    #[cfg(feature = "memory")]
    pub fn memory(config: QueueConfig) -> Self {
        Self::new(crate::backend::memory::MemoryBackend::new(), config)
    }

    /// Build the queue the configuration asks for: Redis when `redis_url` is
    /// set, otherwise the in-memory backend
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        match config.redis_url.as_deref() {
            Some(url) => Self::connect_redis(url, config).await,
            None => Self::connect_memory(config),
        }
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(url: &str, config: &QueueConfig) -> QueueResult<Self> {
        let backend = crate::backend::redis::RedisBackend::connect(url, &config.redis_prefix).await?;
        Ok(Self::new(backend, config.clone()))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(_url: &str, _config: &QueueConfig) -> QueueResult<Self> {
        Err(QueueError::Config(
            "redis_url is set but the `redis` feature is disabled".to_string(),
        ))
    }

    #[cfg(feature = "memory")]
    fn connect_memory(config: &QueueConfig) -> QueueResult<Self> {
        Ok(Self::memory(config.clone()))
    }

    #[cfg(not(feature = "memory"))]
    fn connect_memory(_config: &QueueConfig) -> QueueResult<Self> {
        Err(QueueError::Config(
            "no redis_url configured and the `memory` feature is disabled".to_string(),
        ))
    }

    /// Enqueue a profile key. Returns `false` if the key is already pending,
    /// leased or waiting for a retry, or if the backend failed.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn add_job(&self, key: &str, priority: i64) -> bool {
        let now = Utc::now();
        let score = self.dispatch_score(now, priority);
        let job = Job::new(key, priority);
        let run_id = job.run_id.clone();

        match self.backend.push_pending(job, score).await {
            Ok(true) => {
                self.observability.record(JobEvent::Enqueued {
                    key: key.to_string(),
                    run_id,
                    priority,
                    at: now,
                });
                info!("Added job for {} with priority {}", key, priority);
                true
            }
            Ok(false) => {
                debug!("Job for {} already queued, skipping", key);
                false
            }
            Err(e) => {
                error!("Error adding job for {}: {}", key, e);
                false
            }
        }
    }

    /// Pop the next job and lease it for the configured duration
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn get_next_job(&self) -> Option<Job> {
        let now = Utc::now();
        let lease_until = now + self.lease_span();

        match self.backend.lease_next(now, lease_until).await {
            Ok(Some(leased)) => {
                self.observability.record(JobEvent::Leased {
                    key: leased.job.key.clone(),
                    run_id: leased.job.run_id.clone(),
                    lease_until,
                    at: now,
                });
                debug!("Leased job for {} until {}", leased.job.key, lease_until);
                Some(leased.job)
            }
            Ok(None) => None,
            Err(e) => {
                error!("Error getting next job: {}", e);
                None
            }
        }
    }

    /// Release the lease of a successfully processed job
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn complete_job(&self, key: &str) -> bool {
        match self.backend.take_lease(key).await {
            Ok(Some(_)) => {
                self.observability.record(JobEvent::Completed {
                    key: key.to_string(),
                    at: Utc::now(),
                });
                info!("Completed job for {}", key);
                true
            }
            Ok(None) => {
                warn!("No active lease for {}, completion ignored", key);
                false
            }
            Err(e) => {
                error!("Error completing job for {}: {}", key, e);
                false
            }
        }
    }

    /// Report a failed attempt. The job is retried with backoff while
    /// `attempts < max_retries`, otherwise it is dead-lettered.
    #[instrument(skip(self, error), fields(backend = self.backend.name()))]
    pub async fn fail_job(&self, key: &str, error: &str, max_retries: u32) -> bool {
        let now = Utc::now();
        let policy = self.retry_policy(max_retries);

        match self.backend.fail_lease(key, error, now, &policy).await {
            Ok(Some(failed)) => {
                self.record_route(&failed.route, error, now);
                true
            }
            Ok(None) => {
                warn!("No active lease for {}, failure dropped", key);
                false
            }
            Err(e) => {
                error!("Error failing job for {}: {}", key, e);
                false
            }
        }
    }

    /// Move every due retry back to pending. Returns how many were moved.
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn process_retry_queue(&self) -> usize {
        let now = Utc::now();
        let due = match self.backend.due_retries(now).await {
            Ok(due) => due,
            Err(e) => {
                error!("Error reading retry queue: {}", e);
                return 0;
            }
        };

        let score = self.dispatch_score(now, 0);
        let mut moved = 0;
        for key in due {
            match self.backend.promote_retry(&key, now, score).await {
                Ok(true) => {
                    moved += 1;
                    self.observability.record(JobEvent::Requeued { key, at: now });
                }
                Ok(false) => {}
                Err(e) => error!("Error requeueing retry for {}: {}", key, e),
            }
        }

        if moved > 0 {
            info!("Moved {} jobs from retry queue back to pending", moved);
        }
        moved
    }

    /// Reclaim leases that expired without a report and fail them once each
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn cleanup_stuck_jobs(&self) -> usize {
        let now = Utc::now();
        let expired = match self.backend.expired_leases(now).await {
            Ok(expired) => expired,
            Err(e) => {
                error!("Error scanning for stuck jobs: {}", e);
                return 0;
            }
        };

        let policy = self.retry_policy(self.config.max_retries);
        let mut reclaimed = 0;
        for key in expired {
            match self.backend.reclaim_lease(&key, STUCK_JOB_ERROR, now, &policy).await {
                Ok(Some(failed)) => {
                    warn!("Found stuck job for {} (lease expired {})", key, failed.lease_until);
                    self.observability.record(JobEvent::Reclaimed {
                        key: key.clone(),
                        run_id: failed.route.run_id().clone(),
                        lease_until: failed.lease_until,
                        at: now,
                    });
                    self.record_route(&failed.route, STUCK_JOB_ERROR, now);
                    reclaimed += 1;
                }
                Ok(None) => {}
                Err(e) => error!("Error reclaiming stuck job for {}: {}", key, e),
            }
        }

        if reclaimed > 0 {
            info!("Cleaned up {} stuck jobs", reclaimed);
        }
        reclaimed
    }

    /// Lane counts; zeroed if the backend is unreachable
    pub async fn get_queue_stats(&self) -> QueueStats {
        match self.backend.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Error getting queue stats: {}", e);
                QueueStats::default()
            }
        }
    }

    /// Terminal failures recorded so far
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.backend.dead_letters().await {
            Ok(letters) => letters,
            Err(e) => {
                error!("Error reading dead letters: {}", e);
                Vec::new()
            }
        }
    }

    /// Lane currently holding `key`
    pub async fn lane_of(&self, key: &str) -> Option<Lane> {
        match self.backend.lane_of(key).await {
            Ok(lane) => lane,
            Err(e) => {
                error!("Error looking up {}: {}", key, e);
                None
            }
        }
    }

    /// Subscribe to queue lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.observability.subscribe()
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    /// Counters since this handle's queue was created
    pub fn metrics(&self) -> MetricsSnapshot {
        self.observability.snapshot()
    }

    /// Connectivity check; the one operation that surfaces backend errors
    pub async fn ping(&self) -> QueueResult<()> {
        self.backend.ping().await
    }

    pub async fn close(&self) -> QueueResult<()> {
        info!("Closing {} queue backend", self.backend.name());
        self.backend.close().await
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn retry_policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: self.config.retry_base(),
            cap: self.config.retry_cap(),
        }
    }

    fn record_route(&self, route: &FailureRoute, error: &str, now: DateTime<Utc>) {
        match route {
            FailureRoute::Retry { job, retry_at } => {
                self.observability.record(JobEvent::Retrying {
                    key: job.key.clone(),
                    run_id: job.run_id.clone(),
                    attempts: job.attempts,
                    retry_at: *retry_at,
                    error: error.to_string(),
                    at: now,
                });
                warn!(
                    "Scheduled retry for {} in {} seconds (attempt {}): {}",
                    job.key,
                    (*retry_at - now).num_seconds(),
                    job.attempts,
                    error
                );
            }
            FailureRoute::Dead(letter) => {
                self.observability.record(JobEvent::DeadLettered {
                    key: letter.key.clone(),
                    run_id: letter.run_id.clone(),
                    attempts: letter.attempts,
                    error: error.to_string(),
                    at: now,
                });
                error!(
                    "Job for {} failed permanently after {} attempts: {}",
                    letter.key, letter.attempts, error
                );
            }
        }
    }

    fn dispatch_score(&self, now: DateTime<Utc>, priority: i64) -> i64 {
        now.timestamp_millis()
            .saturating_add(priority.saturating_mul(self.config.priority_unit_ms))
    }

    fn lease_span(&self) -> chrono::Duration {
        chrono_span(self.config.lease_duration())
    }
}

fn chrono_span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
}
