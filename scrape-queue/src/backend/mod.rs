#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{QueueResult, Job, LeasedJob, DeadLetter, FailedLease, QueueStats, Lane, RetryPolicy};

/// Backend trait for queue storage primitives.
///
/// Every method is atomic with respect to the key(s) it touches. Scores are
/// milliseconds since the epoch; the lowest pending score is dispatched first.
/// Retry/backoff policy lives in [`crate::JobQueue`] and reaches the backend
/// as a [`RetryPolicy`] so a failed lease is routed in the same step that
/// releases it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert a job into the pending lane.
    /// Returns `false` without writing if the key is already pending, leased or retrying.
    async fn push_pending(&self, job: Job, score_ms: i64) -> QueueResult<bool>;

    /// Pop the lowest-scoring pending job and lease it until `lease_until`, in one step
    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<LeasedJob>>;

    /// Remove and return the lease held on `key`
    async fn take_lease(&self, key: &str) -> QueueResult<Option<LeasedJob>>;

    /// Keys whose lease expired at or before `now`
    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>>;

    /// Release the lease on `key` and move the job to retry or dead letters
    /// according to `policy`, in one step
    async fn fail_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>>;

    /// Same as [`fail_lease`](Self::fail_lease), but only while the lease is
    /// still expired at `now`
    async fn reclaim_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>>;

    /// Keys in the retry lane that are due at `now`
    async fn due_retries(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>>;

    /// Move one retry entry back to pending at `score_ms` if it is still due.
    /// Returns `true` only for the caller that actually moved it. A retry entry
    /// whose key is already pending is discarded instead.
    async fn promote_retry(&self, key: &str, now: DateTime<Utc>, score_ms: i64) -> QueueResult<bool>;

    /// All recorded terminal failures, oldest first
    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>>;

    /// Which live lane holds `key`, if any
    async fn lane_of(&self, key: &str) -> QueueResult<Option<Lane>>;

    /// Lane counts
    async fn stats(&self) -> QueueResult<QueueStats>;

    /// Connectivity check
    async fn ping(&self) -> QueueResult<()>;

    /// Release backend connections
    async fn close(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Short backend name for logs and status
    fn name(&self) -> &'static str;
}
