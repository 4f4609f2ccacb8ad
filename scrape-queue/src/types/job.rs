use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunId;

/// A unit of scrape work identified by a profile key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Profile key (username) - the job identity
    pub key: String,

    /// Priority offset; lower values dispatch sooner
    pub priority: i64,

    /// When the job first entered the queue
    pub enqueued_at: DateTime<Utc>,

    /// Failed attempts so far (starts at 0)
    pub attempts: u32,

    /// Last failure message (if any)
    pub last_error: Option<String>,

    /// Correlation id carried across retries
    pub run_id: RunId,
}

impl Job {
    /// Create a fresh job for a profile key
    pub fn new(key: impl Into<String>, priority: i64) -> Self {
        Self {
            key: key.into(),
            priority,
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
            run_id: RunId::new(),
        }
    }

    /// Record one failed attempt
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    /// Check if another attempt is allowed under `max_retries`
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.attempts < max_retries
    }
}

/// A job that has been leased by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedJob {
    /// Copy of the job at lease time
    pub job: Job,

    /// When the lease was taken
    pub leased_at: DateTime<Utc>,

    /// When the lease expires
    pub lease_until: DateTime<Utc>,
}

impl LeasedJob {
    pub fn new(job: Job, leased_at: DateTime<Utc>, lease_until: DateTime<Utc>) -> Self {
        Self {
            job,
            leased_at,
            lease_until,
        }
    }

    /// Get the profile key
    pub fn key(&self) -> &str {
        &self.job.key
    }

    /// Check if the lease has expired
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_until <= now
    }

    /// Get time remaining on lease
    pub fn lease_remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.lease_until - now
    }
}

/// Durable record of a job that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub key: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub run_id: RunId,
}

impl DeadLetter {
    /// Build a dead letter from the job's final state
    pub fn from_job(job: &Job, failed_at: DateTime<Utc>) -> Self {
        Self {
            key: job.key.clone(),
            error: job.last_error.clone().unwrap_or_default(),
            attempts: job.attempts,
            failed_at,
            run_id: job.run_id.clone(),
        }
    }
}

/// Where a failed attempt is routed
#[derive(Debug, Clone, PartialEq)]
pub enum FailureRoute {
    /// Parked in the retry lane until `retry_at`
    Retry { job: Job, retry_at: DateTime<Utc> },

    /// Retries exhausted
    Dead(DeadLetter),
}

impl FailureRoute {
    pub fn key(&self) -> &str {
        match self {
            Self::Retry { job, .. } => &job.key,
            Self::Dead(letter) => &letter.key,
        }
    }

    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Retry { job, .. } => &job.run_id,
            Self::Dead(letter) => &letter.run_id,
        }
    }

    /// Failed attempts including this one
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retry { job, .. } => job.attempts,
            Self::Dead(letter) => letter.attempts,
        }
    }
}

/// A lease released by a failure report, with the lane the job moved to
#[derive(Debug, Clone, PartialEq)]
pub struct FailedLease {
    pub lease_until: DateTime<Utc>,
    pub route: FailureRoute,
}

/// Which live lane currently holds a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Lane {
    Pending,
    Leased,
    Retry,
}

impl Lane {
    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Retry => "retry",
        }
    }
}

/// Queue counts per lane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub retry: usize,
    /// Dead letters recorded so far (not part of `total`)
    pub dead: usize,
    /// pending + leased + retry
    pub total: usize,
}

impl QueueStats {
    pub fn new(pending: usize, leased: usize, retry: usize, dead: usize) -> Self {
        Self {
            pending,
            leased,
            retry,
            dead,
            total: pending + leased + retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_failure_increments_attempts() {
        let mut job = Job::new("alice", 0);
        assert!(job.can_retry(3));

        job.record_failure("timeout");
        job.record_failure("blocked");
        job.record_failure("timeout");

        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert!(!job.can_retry(3));
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let now = Utc::now();
        let leased = LeasedJob::new(Job::new("bob", 0), now, now + chrono::Duration::minutes(30));

        assert!(!leased.lease_expired(now));
        assert!(leased.lease_expired(now + chrono::Duration::minutes(30)));
        assert_eq!(leased.lease_remaining(now), chrono::Duration::minutes(30));
    }

    #[test]
    fn test_stats_total_excludes_dead() {
        let stats = QueueStats::new(2, 1, 3, 7);
        assert_eq!(stats.total, 6);
    }
}
