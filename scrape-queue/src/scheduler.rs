//! Staleness-driven scheduler: finds due profiles and keeps the queue healthy.

use std::sync::Arc;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    SchedulerConfig, DueProfile, QueueStats,
    queue::JobQueue,
    store::ProfileStore,
};

/// Monitored profile keys shared between the scheduler and the orchestrator
pub type ProfileList = Arc<RwLock<Vec<String>>>;

/// Point-in-time scheduler report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub profiles_monitored: usize,
    pub queue_stats: QueueStats,
    pub check_interval_minutes: u64,
    pub refresh_interval_minutes: u64,
}

/// Everything a timer task needs to run a pass
#[derive(Clone)]
struct SchedulerCore {
    queue: JobQueue,
    store: Arc<dyn ProfileStore>,
    config: SchedulerConfig,
}

impl SchedulerCore {
    async fn get_due_profiles(&self) -> Vec<DueProfile> {
        let due = match self.store.get_due_profiles(self.config.refresh_interval_minutes).await {
            Ok(due) => due,
            Err(e) => {
                error!("Profile store error while looking for due profiles: {}", e);
                return Vec::new();
            }
        };

        if due.is_empty() {
            match self.store.count_active_tracked().await {
                Ok(count) => info!("No profiles due for scraping ({} actively tracked)", count),
                Err(e) => warn!("No profiles due for scraping; tracked count unavailable: {}", e),
            }
        } else {
            info!("Found {} profiles due for scraping", due.len());
            for profile in &due {
                debug!("  {} - last scraped: {}", profile.key, profile.since_last_scrape);
            }
        }

        due
    }

    async fn schedule_profiles(&self) -> usize {
        let due = self.get_due_profiles().await;
        if due.is_empty() {
            return 0;
        }

        let mut added = 0;
        for profile in &due {
            if self.queue.add_job(&profile.key, profile.scrape_priority()).await {
                added += 1;
            }
        }

        info!("Added {}/{} profiles to scraping queue", added, due.len());
        added
    }

    async fn check_pass(&self) {
        info!("Running scheduled profile check");
        self.schedule_profiles().await;
        self.queue.process_retry_queue().await;
        self.queue.cleanup_stuck_jobs().await;

        let stats = self.queue.get_queue_stats().await;
        info!(
            "Queue stats: {} pending, {} leased, {} retry, {} dead",
            stats.pending, stats.leased, stats.retry, stats.dead
        );
    }

    async fn maintenance_pass(&self) {
        debug!("Running queue maintenance");
        self.queue.process_retry_queue().await;
        self.queue.cleanup_stuck_jobs().await;
    }
}

struct SchedulerTimers {
    shutdown_tx: watch::Sender<bool>,
    check: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

/// Periodically enqueues due profiles and runs queue maintenance
pub struct Scheduler {
    core: SchedulerCore,
    profiles: ProfileList,
    timers: Mutex<Option<SchedulerTimers>>,
}

impl Scheduler {
    pub fn new(
        queue: JobQueue,
        store: Arc<dyn ProfileStore>,
        config: SchedulerConfig,
        profiles: ProfileList,
    ) -> Self {
        Self {
            core: SchedulerCore { queue, store, config },
            profiles,
            timers: Mutex::new(None),
        }
    }

    /// Profiles due for scraping, never-scraped first; empty on store errors
    pub async fn get_due_profiles(&self) -> Vec<DueProfile> {
        self.core.get_due_profiles().await
    }

    /// Enqueue every due profile. Returns how many were newly added.
    #[instrument(skip(self))]
    pub async fn schedule_profiles(&self) -> usize {
        self.core.schedule_profiles().await
    }

    pub fn is_running(&self) -> bool {
        self.timers.lock().is_some()
    }

    pub fn profiles(&self) -> ProfileList {
        self.profiles.clone()
    }

    /// Run one scheduling pass now, then start the check and maintenance timers
    pub async fn start(&self) {
        if self.is_running() {
            warn!("Scheduler is already running");
            return;
        }

        let config = &self.core.config;
        info!(
            "Starting profile scheduler: {} profiles, check every {} minutes, refresh after {} minutes",
            self.profiles.read().len(),
            config.check_interval_minutes,
            config.refresh_interval_minutes
        );

        self.core.schedule_profiles().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let core = self.core.clone();
        let check = tokio::spawn(run_timer(
            config.check_interval(),
            shutdown_rx.clone(),
            move || {
                let core = core.clone();
                async move { core.check_pass().await }
            },
        ));

        let core = self.core.clone();
        let maintenance = tokio::spawn(run_timer(
            config.maintenance_interval(),
            shutdown_rx,
            move || {
                let core = core.clone();
                async move { core.maintenance_pass().await }
            },
        ));

        let mut timers = self.timers.lock();
        if timers.is_some() {
            // lost a start race: keep the timers already installed
            let _ = shutdown_tx.send(true);
            return;
        }
        *timers = Some(SchedulerTimers {
            shutdown_tx,
            check,
            maintenance,
        });
        info!("Profile scheduler started");
    }

    /// Stop both timers. The queue is left open for its owner to close.
    pub async fn stop(&self) {
        let Some(timers) = self.timers.lock().take() else {
            debug!("Scheduler is not running");
            return;
        };

        info!("Stopping profile scheduler");
        let _ = timers.shutdown_tx.send(true);
        for (name, handle) in [("check", timers.check), ("maintenance", timers.maintenance)] {
            if let Err(e) = handle.await {
                error!("Scheduler {} loop ended abnormally: {}", name, e);
            }
        }
        info!("Profile scheduler stopped");
    }

    pub async fn status(&self) -> SchedulerStatus {
        let profiles_monitored = self.profiles.read().len();

        SchedulerStatus {
            running: self.is_running(),
            profiles_monitored,
            queue_stats: self.core.queue.get_queue_stats().await,
            check_interval_minutes: self.core.config.check_interval_minutes,
            refresh_interval_minutes: self.core.config.refresh_interval_minutes,
        }
    }
}

async fn run_timer<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => pass().await,
            _ = shutdown.changed() => break,
        }
    }
}
