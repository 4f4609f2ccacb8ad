use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    QueueResult, Job, LeasedJob, DeadLetter, FailureRoute, FailedLease, QueueStats, Lane,
    RetryPolicy, backend::QueueBackend,
};

/// Pending ordering: (score_ms, insertion sequence)
pub(crate) type PendingSlot = (i64, u64);

/// All queue lanes behind a single lock so every backend call is atomic
#[derive(Debug, Default)]
pub(crate) struct Lanes {
    /// Pending jobs ordered by dispatch score, FIFO within equal scores
    pub(crate) pending: BTreeMap<PendingSlot, Job>,

    /// Key -> pending slot, for duplicate detection
    pub(crate) pending_index: HashMap<String, PendingSlot>,

    /// In-flight jobs keyed by profile key
    pub(crate) leased: HashMap<String, LeasedJob>,

    /// Failed jobs waiting for their retry time
    pub(crate) retry: HashMap<String, (DateTime<Utc>, Job)>,

    /// Terminal failures
    pub(crate) dead: Vec<DeadLetter>,

    /// Monotonic insertion counter
    pub(crate) seq: u64,
}

impl Lanes {
    pub(crate) fn lane_of(&self, key: &str) -> Option<Lane> {
        if self.pending_index.contains_key(key) {
            Some(Lane::Pending)
        } else if self.leased.contains_key(key) {
            Some(Lane::Leased)
        } else if self.retry.contains_key(key) {
            Some(Lane::Retry)
        } else {
            None
        }
    }

    pub(crate) fn insert_pending(&mut self, job: Job, score_ms: i64) {
        self.seq += 1;
        let slot = (score_ms, self.seq);
        self.pending_index.insert(job.key.clone(), slot);
        self.pending.insert(slot, job);
    }

    /// Route a released lease while the lock is still held, so the key moves
    /// straight from leased to retry or dead letters
    pub(crate) fn route_failure(
        &mut self,
        leased: LeasedJob,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailedLease {
        let lease_until = leased.lease_until;
        let route = policy.route(leased.job, error, now);

        match &route {
            FailureRoute::Retry { job, retry_at } => {
                self.retry.insert(job.key.clone(), (*retry_at, job.clone()));
            }
            FailureRoute::Dead(letter) => self.dead.push(letter.clone()),
        }

        FailedLease { lease_until, route }
    }
}

/// In-memory backend for tests, development and single-process deployments
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub(crate) lanes: Arc<RwLock<Lanes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn push_pending(&self, job: Job, score_ms: i64) -> QueueResult<bool> {
        let mut lanes = self.lanes.write();
        if lanes.lane_of(&job.key).is_some() {
            return Ok(false);
        }
        lanes.insert_pending(job, score_ms);
        Ok(true)
    }

    async fn lease_next(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> QueueResult<Option<LeasedJob>> {
        let mut lanes = self.lanes.write();

        let Some((_, job)) = lanes.pending.pop_first() else {
            return Ok(None);
        };
        lanes.pending_index.remove(&job.key);

        let leased = LeasedJob::new(job, now, lease_until);
        lanes.leased.insert(leased.job.key.clone(), leased.clone());

        Ok(Some(leased))
    }

    async fn take_lease(&self, key: &str) -> QueueResult<Option<LeasedJob>> {
        Ok(self.lanes.write().leased.remove(key))
    }

    async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        Ok(self.expired_lease_keys(now))
    }

    async fn fail_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>> {
        let mut lanes = self.lanes.write();
        let Some(leased) = lanes.leased.remove(key) else {
            return Ok(None);
        };
        Ok(Some(lanes.route_failure(leased, error, now, policy)))
    }

    async fn reclaim_lease(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> QueueResult<Option<FailedLease>> {
        Ok(self.reclaim_if_expired(key, error, now, policy))
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
        let lanes = self.lanes.read();
        let mut due: Vec<_> = lanes
            .retry
            .iter()
            .filter(|(_, (retry_at, _))| *retry_at <= now)
            .map(|(key, (retry_at, _))| (*retry_at, key.clone()))
            .collect();
        due.sort();
        Ok(due.into_iter().map(|(_, key)| key).collect())
    }

    async fn promote_retry(&self, key: &str, now: DateTime<Utc>, score_ms: i64) -> QueueResult<bool> {
        let mut lanes = self.lanes.write();

        let still_due = matches!(lanes.retry.get(key), Some((retry_at, _)) if *retry_at <= now);
        if !still_due {
            return Ok(false);
        }

        if lanes.pending_index.contains_key(key) {
            lanes.retry.remove(key);
            return Ok(false);
        }

        match lanes.retry.remove(key) {
            Some((_, job)) => {
                lanes.insert_pending(job, score_ms);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
        Ok(self.lanes.read().dead.clone())
    }

    async fn lane_of(&self, key: &str) -> QueueResult<Option<Lane>> {
        Ok(self.lanes.read().lane_of(key))
    }

    async fn stats(&self) -> QueueResult<QueueStats> {
        let lanes = self.lanes.read();
        Ok(QueueStats::new(
            lanes.pending.len(),
            lanes.leased.len(),
            lanes.retry.len(),
            lanes.dead.len(),
        ))
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease_window() -> (DateTime<Utc>, DateTime<Utc>) {
        let now = Utc::now();
        (now, now + Duration::minutes(30))
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base: std::time::Duration::from_secs(30),
            cap: std::time::Duration::from_secs(300),
        }
    }

    /// Push, lease and fail `key` once so it sits in the retry lane
    async fn park_in_retry(backend: &MemoryBackend, key: &str) {
        backend.push_pending(Job::new(key, 0), 0).await.unwrap();
        let (now, until) = lease_window();
        backend.lease_next(now, until).await.unwrap().unwrap();
        backend.fail_lease(key, "timeout", now, &policy(3)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_push_then_lease() {
        let backend = MemoryBackend::new();
        assert!(backend.push_pending(Job::new("alice", 0), 10).await.unwrap());

        let (now, until) = lease_window();
        let leased = backend.lease_next(now, until).await.unwrap().unwrap();

        assert_eq!(leased.key(), "alice");
        assert_eq!(leased.lease_until, until);
        assert_eq!(backend.lane_of("alice").await.unwrap(), Some(Lane::Leased));
        assert!(backend.lease_next(now, until).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_in_every_lane() {
        let backend = MemoryBackend::new();
        assert!(backend.push_pending(Job::new("alice", 0), 10).await.unwrap());
        assert!(!backend.push_pending(Job::new("alice", 5), 1).await.unwrap());

        let (now, until) = lease_window();
        backend.lease_next(now, until).await.unwrap();
        assert!(!backend.push_pending(Job::new("alice", 0), 10).await.unwrap());

        backend.fail_lease("alice", "timeout", now, &policy(3)).await.unwrap();
        assert!(!backend.push_pending(Job::new("alice", 0), 10).await.unwrap());

        assert_eq!(backend.stats().await.unwrap(), QueueStats::new(0, 0, 1, 0));
    }

    #[tokio::test]
    async fn test_fail_lease_routes_in_one_step() {
        let backend = MemoryBackend::new();
        backend.push_pending(Job::new("alice", 0), 0).await.unwrap();
        let (now, until) = lease_window();
        backend.lease_next(now, until).await.unwrap();

        let failed = backend.fail_lease("alice", "timeout", now, &policy(1)).await.unwrap().unwrap();

        assert_eq!(failed.lease_until, until);
        assert!(matches!(failed.route, FailureRoute::Dead(ref letter) if letter.attempts == 1));
        assert_eq!(backend.lane_of("alice").await.unwrap(), None);
        assert_eq!(backend.dead_letters().await.unwrap().len(), 1);
        assert!(backend.fail_lease("alice", "timeout", now, &policy(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_equal_scores_keep_insertion_order() {
        let backend = MemoryBackend::new();
        for key in ["a", "b", "c"] {
            backend.push_pending(Job::new(key, 0), 100).await.unwrap();
        }

        let (now, until) = lease_window();
        let mut order = Vec::new();
        while let Some(leased) = backend.lease_next(now, until).await.unwrap() {
            order.push(leased.job.key);
        }
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_promote_retry_only_once() {
        let backend = MemoryBackend::new();
        park_in_retry(&backend, "bob").await;
        backend.force_retry_due("bob");

        let now = Utc::now();
        assert!(backend.promote_retry("bob", now, 1).await.unwrap());
        assert!(!backend.promote_retry("bob", now, 1).await.unwrap());
        assert_eq!(backend.lane_of("bob").await.unwrap(), Some(Lane::Pending));
    }

    #[tokio::test]
    async fn test_future_retry_not_promoted() {
        let backend = MemoryBackend::new();
        park_in_retry(&backend, "bob").await;

        let now = Utc::now();
        assert!(backend.due_retries(now).await.unwrap().is_empty());
        assert!(!backend.promote_retry("bob", now, 1).await.unwrap());
        assert_eq!(backend.lane_of("bob").await.unwrap(), Some(Lane::Retry));
    }

    #[tokio::test]
    async fn test_promote_discards_retry_for_pending_key() {
        let backend = MemoryBackend::new();
        let now = Utc::now();
        {
            let mut lanes = backend.lanes.write();
            lanes.insert_pending(Job::new("carol", 0), 0);
            lanes.retry.insert("carol".to_string(), (now - Duration::seconds(1), Job::new("carol", 0)));
        }

        assert!(!backend.promote_retry("carol", now, 1).await.unwrap());

        assert_eq!(backend.stats().await.unwrap(), QueueStats::new(1, 0, 0, 0));
        let (now, until) = lease_window();
        assert!(backend.lease_next(now, until).await.unwrap().is_some());
        assert!(backend.lease_next(now, until).await.unwrap().is_none());
    }
}
