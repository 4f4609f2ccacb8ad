//! # scrape-queue: Distributed Profile-Scraping Job System
//!
//! **Lease-based priority queue, staleness scheduler, worker pool and orchestrator**
//!
//! scrape-queue keeps a set of tracked profiles fresh. A scheduler asks the
//! profile store which profiles are due, enqueues them with a staleness-derived
//! priority, and a pool of workers leases jobs, scrapes and reports back.
//!
//! ## 🎯 Guarantees
//!
//! - **Lease Exclusivity**: a profile key is pending, leased or retrying in at most one place
//! - **Atomic Dequeue**: pop and lease happen in one backend step (mutex or Lua script)
//! - **Bounded Retries**: exponential backoff capped at 5 minutes, then a dead letter
//! - **Stuck-Job Recovery**: expired leases are reclaimed exactly once
//! - **Graceful Shutdown**: in-flight scrapes finish, idle waits are interrupted
//!
//! ## 🚀 Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use scrape_queue::prelude::*;
//!
//! struct HttpScraper;
//!
//! #[async_trait]
//! impl Scraper for HttpScraper {
//!     async fn scrape_profile(&self, key: &str) -> Result<ScrapeReport, ScrapeError> {
//!         // fetch and persist the profile here
//!         Ok(ScrapeReport::succeeded(0, 0, 0))
//!     }
//! }
//!
//! # async fn run() -> QueueResult<()> {
//! let store = MemoryProfileStore::new();
//! store.track("some_creator");
//!
//! let system = Orchestrator::connect(
//!     SystemConfig::from_env(),
//!     Arc::new(store),
//!     Arc::new(HttpScraper),
//!     vec!["some_creator".to_string()],
//! )
//! .await?;
//!
//! system.initialize().await?;
//! system.start().await?;
//! system.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod backend;
pub mod queue;
pub mod scraper;
pub mod store;
pub mod scheduler;
pub mod worker;
pub mod orchestrator;
pub mod observability;

// Core API exports
pub use types::{
    RunId, Job, LeasedJob, DeadLetter, FailureRoute, FailedLease, QueueStats, Lane, DueProfile, SinceLastScrape, JobEvent,
    sort_due_profiles, STALENESS_PRIORITY_CEILING,
};
pub use error::{QueueError, QueueResult, StoreError, ScrapeError};
pub use config::{SystemConfig, QueueConfig, SchedulerConfig, WorkerConfig};
pub use backend::QueueBackend;
pub use queue::{JobQueue, RetryPolicy, retry_backoff, STUCK_JOB_ERROR};
pub use scraper::{Scraper, ScrapeReport};
pub use store::ProfileStore;
pub use scheduler::{Scheduler, SchedulerStatus, ProfileList};
pub use worker::{Worker, WorkerHandle, WorkerStatus};
pub use orchestrator::{Orchestrator, OrchestratorState, SystemStatus, normalize_profiles};

// Observability exports
pub use observability::{ObservabilityLayer, LiveMetrics, MetricsSnapshot};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

// Backend implementations
#[cfg(feature = "memory")]
pub use backend::memory::MemoryBackend;

#[cfg(feature = "memory")]
pub use store::MemoryProfileStore;

#[cfg(feature = "redis")]
pub use backend::redis::RedisBackend;

/// Everything needed to wire up a scraping system
pub mod prelude {
    pub use crate::{
        Orchestrator, JobQueue, Scheduler, Worker, Scraper, ScrapeReport, ProfileStore
    };

    pub use crate::{
        SystemConfig, QueueConfig, SchedulerConfig, WorkerConfig
    };

    pub use crate::{
        QueueError, QueueResult, ScrapeError, StoreError, DueProfile, JobEvent, QueueStats
    };

    #[cfg(feature = "memory")]
    pub use crate::{MemoryBackend, MemoryProfileStore};

    pub use async_trait::async_trait;
}
