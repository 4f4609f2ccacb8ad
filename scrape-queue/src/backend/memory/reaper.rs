use chrono::{DateTime, Utc};

use crate::{FailedLease, RetryPolicy, backend::memory::storage::MemoryBackend};

/// Lease expiry support for the memory backend
impl MemoryBackend {
    /// Keys whose lease expired at or before `now`, oldest expiry first
    pub(crate) fn expired_lease_keys(&self, now: DateTime<Utc>) -> Vec<String> {
        let lanes = self.lanes.read();
        let mut expired: Vec<_> = lanes
            .leased
            .values()
            .filter(|leased| leased.lease_expired(now))
            .map(|leased| (leased.lease_until, leased.job.key.clone()))
            .collect();
        expired.sort();
        expired.into_iter().map(|(_, key)| key).collect()
    }

    /// Reclaim and route the lease only if it is still expired; a concurrent
    /// reclaim or a late completion makes this return `None`
    pub(crate) fn reclaim_if_expired(
        &self,
        key: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<FailedLease> {
        let mut lanes = self.lanes.write();
        let expired = lanes.leased.get(key).is_some_and(|leased| leased.lease_expired(now));
        if !expired {
            return None;
        }

        let leased = lanes.leased.remove(key)?;
        Some(lanes.route_failure(leased, error, now, policy))
    }
}

/// Test helpers for deterministic testing
impl MemoryBackend {
    /// Force a lease to expire (test helper)
    pub fn force_lease_expiry(&self, key: &str) -> bool {
        let mut lanes = self.lanes.write();
        match lanes.leased.get_mut(key) {
            Some(leased) => {
                leased.lease_until = Utc::now() - chrono::Duration::seconds(1);
                true
            }
            None => false,
        }
    }

    /// Make a retry entry due immediately (test helper)
    pub fn force_retry_due(&self, key: &str) -> bool {
        let mut lanes = self.lanes.write();
        match lanes.retry.get_mut(key) {
            Some((retry_at, _)) => {
                *retry_at = Utc::now() - chrono::Duration::seconds(1);
                true
            }
            None => false,
        }
    }

    /// Scheduled retry time for a key (test helper)
    pub fn retry_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.lanes.read().retry.get(key).map(|(retry_at, _)| *retry_at)
    }
}
