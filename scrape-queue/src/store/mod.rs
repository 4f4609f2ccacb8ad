//! Boundary to the profile tracking store.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryProfileStore;

use async_trait::async_trait;

use crate::{DueProfile, StoreError};

/// Read access to tracked profiles plus the last-scraped write-back
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Actively tracked profiles never scraped or last scraped more than
    /// `refresh_minutes` ago, never-scraped first then oldest first
    async fn get_due_profiles(&self, refresh_minutes: u64) -> Result<Vec<DueProfile>, StoreError>;

    /// Record a successful scrape. Returns `false` if the key is unknown.
    async fn update_last_scraped(&self, key: &str) -> Result<bool, StoreError>;

    async fn count_active_tracked(&self) -> Result<u64, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError> {
        self.count_active_tracked().await.map(|_| ())
    }
}
