use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::{DueProfile, StoreError, sort_due_profiles, store::ProfileStore};

#[derive(Debug, Clone)]
struct TrackedProfile {
    last_scraped: Option<DateTime<Utc>>,
    active: bool,
}

/// In-process profile store applying the same due rule as the SQL store
#[derive(Clone, Default)]
pub struct MemoryProfileStore {
    profiles: Arc<RwLock<HashMap<String, TrackedProfile>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a profile that has never been scraped
    pub fn track(&self, key: impl Into<String>) {
        self.track_with_last_scraped(key, None);
    }

    pub fn track_with_last_scraped(&self, key: impl Into<String>, last_scraped: Option<DateTime<Utc>>) {
        self.profiles.write().insert(
            key.into(),
            TrackedProfile {
                last_scraped,
                active: true,
            },
        );
    }

    /// Stop tracking a profile; it keeps its history but is never due
    pub fn untrack(&self, key: &str) -> bool {
        match self.profiles.write().get_mut(key) {
            Some(profile) => {
                profile.active = false;
                true
            }
            None => false,
        }
    }

    pub fn last_scraped(&self, key: &str) -> Option<DateTime<Utc>> {
        self.profiles.read().get(key).and_then(|profile| profile.last_scraped)
    }

    /// Make every call fail with `StoreError::Unavailable` (test helper)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileStore {
    async fn get_due_profiles(&self, refresh_minutes: u64) -> Result<Vec<DueProfile>, StoreError> {
        self.check_available()?;

        let now = Utc::now();
        let refresh = i64::try_from(refresh_minutes).unwrap_or(i64::MAX);
        let threshold = Duration::try_minutes(refresh).and_then(|span| now.checked_sub_signed(span));

        let mut due: Vec<_> = self
            .profiles
            .read()
            .iter()
            .filter(|(_, profile)| profile.active)
            .filter(|(_, profile)| match profile.last_scraped {
                None => true,
                Some(at) => threshold.is_some_and(|threshold| at < threshold),
            })
            .map(|(key, profile)| DueProfile::new(key.clone(), profile.last_scraped, now))
            .collect();

        sort_due_profiles(&mut due);
        Ok(due)
    }

    async fn update_last_scraped(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;

        match self.profiles.write().get_mut(key) {
            Some(profile) => {
                profile.last_scraped = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_active_tracked(&self) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.profiles.read().values().filter(|profile| profile.active).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_due_rule_and_order() {
        let store = MemoryProfileStore::new();
        let now = Utc::now();
        store.track("never");
        store.track_with_last_scraped("fresh", Some(now - Duration::minutes(10)));
        store.track_with_last_scraped("stale", Some(now - Duration::minutes(200)));
        store.track_with_last_scraped("staler", Some(now - Duration::minutes(400)));
        store.track_with_last_scraped("dropped", None);
        store.untrack("dropped");

        let due = store.get_due_profiles(150).await.unwrap();
        let keys: Vec<_> = due.iter().map(|p| p.key.as_str()).collect();

        assert_eq!(keys, vec!["never", "staler", "stale"]);
        assert_eq!(store.count_active_tracked().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_update_last_scraped() {
        let store = MemoryProfileStore::new();
        store.track("alice");

        assert!(store.update_last_scraped("alice").await.unwrap());
        assert!(!store.update_last_scraped("nobody").await.unwrap());
        assert!(store.last_scraped("alice").is_some());
        assert!(store.get_due_profiles(150).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryProfileStore::new();
        store.set_unavailable(true);

        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.get_due_profiles(150).await.is_err());
    }
}
