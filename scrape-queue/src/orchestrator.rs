//! Supervises the scheduler and the worker pool as one system.
//!
//! Lifecycle: `Stopped -> Initializing -> Running -> Stopping -> Stopped`.
//! [`Orchestrator`] is a cheap `Clone` handle; the signal handler and the
//! status report loop each hold one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, SystemConfig,
    observability::MetricsSnapshot,
    queue::JobQueue,
    scheduler::{ProfileList, Scheduler, SchedulerStatus},
    scraper::Scraper,
    store::ProfileStore,
    worker::{Worker, WorkerHandle, WorkerStatus},
};

/// Orchestrator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Stopped,
    Initializing,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub total: usize,
    pub running: usize,
    pub details: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub total_completed: u64,
    pub total_failed: u64,
    /// `None` until at least one job has finished
    pub success_rate: Option<f64>,
}

/// Aggregate view of the whole system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub state: OrchestratorState,
    pub scheduler: Option<SchedulerStatus>,
    pub workers: WorkerSummary,
    pub performance: Performance,
    pub queue_metrics: MetricsSnapshot,
}

struct Inner {
    config: SystemConfig,
    queue: JobQueue,
    store: Arc<dyn ProfileStore>,
    scraper: Arc<dyn Scraper>,
    profiles: ProfileList,
    handle_signals: bool,
    state: watch::Sender<OrchestratorState>,
    has_run: AtomicBool,
    scheduler: RwLock<Option<Arc<Scheduler>>>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    report_loop: Mutex<Option<JoinHandle<()>>>,
    background_shutdown: watch::Sender<bool>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// Owns the scheduler and `worker_count` workers over one shared queue
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: SystemConfig,
        queue: JobQueue,
        store: Arc<dyn ProfileStore>,
        scraper: Arc<dyn Scraper>,
        profiles: Vec<String>,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Stopped);
        let (background_shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                store,
                scraper,
                profiles: Arc::new(RwLock::new(profiles)),
                handle_signals: true,
                state,
                has_run: AtomicBool::new(false),
                scheduler: RwLock::new(None),
                workers: tokio::sync::Mutex::new(Vec::new()),
                report_loop: Mutex::new(None),
                background_shutdown,
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Build the queue from `config.queue` and wrap it in an orchestrator
    pub async fn connect(
        config: SystemConfig,
        store: Arc<dyn ProfileStore>,
        scraper: Arc<dyn Scraper>,
        profiles: Vec<String>,
    ) -> QueueResult<Self> {
        let queue = JobQueue::connect(&config.queue).await?;
        Ok(Self::new(config, queue, store, scraper, profiles))
    }

    /// Disable SIGINT/SIGTERM handling (embedding, tests)
    pub fn without_signal_handling(self) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.handle_signals = false;
                Self { inner: Arc::new(inner) }
            }
            Err(inner) => {
                warn!("Orchestrator already shared, signal handling left enabled");
                Self { inner }
            }
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.inner.state.borrow()
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    /// Snapshot of the monitored profile keys
    pub fn profiles(&self) -> Vec<String> {
        self.inner.profiles.read().clone()
    }

    /// Verify connectivity, normalize the profile list and build the scheduler
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> QueueResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let state = self.state();
        if state != OrchestratorState::Stopped {
            return Err(QueueError::InvalidState(format!("cannot initialize while {:?}", state)));
        }

        self.set_state(OrchestratorState::Initializing);
        info!(
            "Initializing scraping system: {} profiles, {} workers",
            self.inner.profiles.read().len(),
            self.inner.config.workers.worker_count
        );

        if let Err(e) = self.verify().await {
            error!("System initialization failed: {}", e);
            self.set_state(OrchestratorState::Stopped);
            return Err(e);
        }

        {
            let mut profiles = self.inner.profiles.write();
            let normalized = normalize_profiles(profiles.iter().map(String::as_str));
            if normalized.len() != profiles.len() {
                info!("Normalized profile list from {} to {} entries", profiles.len(), normalized.len());
            }
            *profiles = normalized;
        }

        let scheduler = Scheduler::new(
            self.inner.queue.clone(),
            self.inner.store.clone(),
            self.inner.config.scheduler.clone(),
            self.inner.profiles.clone(),
        );
        *self.inner.scheduler.write() = Some(Arc::new(scheduler));

        info!("System initialization complete");
        Ok(())
    }

    async fn verify(&self) -> QueueResult<()> {
        self.inner.config.validate()?;
        self.inner.queue.ping().await?;
        info!("Queue backend '{}' reachable", self.inner.queue.backend_name());
        self.inner.store.ping().await?;
        info!("Profile store reachable");
        Ok(())
    }

    /// Start the scheduler, the workers, the status report and signal handling
    #[instrument(skip(self))]
    pub async fn start(&self) -> QueueResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.state() {
            OrchestratorState::Initializing => {}
            OrchestratorState::Running => {
                warn!("System is already running");
                return Ok(());
            }
            state => {
                return Err(QueueError::InvalidState(format!(
                    "cannot start while {:?}; initialize first",
                    state
                )));
            }
        }

        let scheduler = self
            .scheduler()
            .ok_or_else(|| QueueError::InvalidState("scheduler not initialized".to_string()))?;

        info!("Starting scraping system");
        self.inner.background_shutdown.send_replace(false);

        // timers and workers only ever fire in Running
        self.set_state(OrchestratorState::Running);
        self.inner.has_run.store(true, Ordering::SeqCst);

        scheduler.start().await;
        self.start_workers().await;

        let report = tokio::spawn(self.clone().report_loop());
        *self.inner.report_loop.lock() = Some(report);

        if self.inner.handle_signals {
            tokio::spawn(self.clone().signal_loop());
        }

        info!("Scraping system started");
        Ok(())
    }

    async fn start_workers(&self) {
        let count = self.inner.config.workers.worker_count;
        let stagger = self.inner.config.workers.spawn_stagger();
        let mut workers = self.inner.workers.lock().await;

        for id in 1..=count {
            workers.push(self.spawn_worker(id));
            info!("Worker {} started", id);
            if id < count && !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
        }

        info!("{}/{} workers started", workers.len(), count);
    }

    fn spawn_worker(&self, id: usize) -> WorkerHandle {
        Worker::new(
            id,
            self.inner.queue.clone(),
            self.inner.scraper.clone(),
            self.inner.store.clone(),
            self.inner.config.workers.clone(),
        )
        .spawn()
    }

    /// Stop workers (each finishes its current job), the scheduler and the
    /// report loop, then close the queue. Calling it again is a logged no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> QueueResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        match self.state() {
            OrchestratorState::Running => {}
            OrchestratorState::Initializing => {
                info!("System was initialized but never started");
                self.set_state(OrchestratorState::Stopped);
                return Ok(());
            }
            _ => {
                warn!("System is not running");
                return Ok(());
            }
        }

        info!("Stopping scraping system");
        self.set_state(OrchestratorState::Stopping);

        self.inner.background_shutdown.send_replace(true);
        let report = self.inner.report_loop.lock().take();
        if let Some(report) = report {
            if let Err(e) = report.await {
                error!("Status report loop ended abnormally: {}", e);
            }
        }

        let workers: Vec<_> = self.inner.workers.lock().await.drain(..).collect();
        info!("Stopping {} workers", workers.len());
        for worker in &workers {
            worker.signal_stop();
        }
        for (id, result) in join_all(workers.into_iter().map(|w| async move { (w.id(), w.shutdown().await) })).await {
            if let Err(e) = result {
                error!("Error stopping worker {}: {}", id, e);
            }
        }
        info!("All workers stopped");

        if let Some(scheduler) = self.scheduler() {
            scheduler.stop().await;
        }

        if let Err(e) = self.inner.queue.close().await {
            error!("Error closing queue: {}", e);
        }

        self.set_state(OrchestratorState::Stopped);
        info!("Scraping system stopped gracefully");
        Ok(())
    }

    /// Resolve once the system has run and come back to `Stopped`
    pub async fn wait(&self) {
        let mut state = self.inner.state.subscribe();
        loop {
            let done = self.inner.has_run.load(Ordering::SeqCst)
                && *state.borrow_and_update() == OrchestratorState::Stopped;
            if done || state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Replace worker `id` (1-based) with a fresh one. The old worker finishes
    /// its current job in the background of this call, outside the pool lock.
    #[instrument(skip(self))]
    pub async fn restart_worker(&self, id: usize) -> bool {
        info!("Restarting worker {}", id);

        let old = {
            let mut workers = self.inner.workers.lock().await;
            if id == 0 || id > workers.len() {
                error!("Invalid worker ID: {}", id);
                return false;
            }

            let old = std::mem::replace(&mut workers[id - 1], self.spawn_worker(id));
            old.signal_stop();
            old
        };
        info!("Worker {} restarted", id);

        if let Err(e) = old.shutdown().await {
            error!("Worker {} did not stop cleanly: {}", id, e);
        }
        true
    }

    /// Add profiles to the monitoring list. Returns how many were new.
    pub fn add_profiles<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut profiles = self.inner.profiles.write();
        let mut added = 0;
        for key in keys {
            let key = key.as_ref().trim();
            if !key.is_empty() && !profiles.iter().any(|existing| existing == key) {
                profiles.push(key.to_string());
                added += 1;
            }
        }

        info!("Added {} new profiles to monitoring", added);
        added
    }

    /// Remove profiles from the monitoring list. Returns how many were removed.
    pub fn remove_profiles<I, S>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let remove: HashSet<String> = keys.into_iter().map(|key| key.as_ref().trim().to_string()).collect();
        let mut profiles = self.inner.profiles.write();
        let before = profiles.len();
        profiles.retain(|key| !remove.contains(key));

        let removed = before - profiles.len();
        info!("Removed {} profiles from monitoring", removed);
        removed
    }

    pub async fn system_status(&self) -> SystemStatus {
        let scheduler = match self.scheduler() {
            Some(scheduler) => Some(scheduler.status().await),
            None => None,
        };

        let details: Vec<WorkerStatus> = self
            .inner
            .workers
            .lock()
            .await
            .iter()
            .map(WorkerHandle::status)
            .collect();

        let total_completed = details.iter().map(|w| w.completed).sum::<u64>();
        let total_failed = details.iter().map(|w| w.failed).sum::<u64>();
        let finished = total_completed + total_failed;

        SystemStatus {
            state: self.state(),
            scheduler,
            workers: WorkerSummary {
                total: details.len(),
                running: details.iter().filter(|w| w.running).count(),
                details,
            },
            performance: Performance {
                total_completed,
                total_failed,
                success_rate: (finished > 0).then(|| total_completed as f64 / finished as f64 * 100.0),
            },
            queue_metrics: self.inner.queue.metrics(),
        }
    }

    /// Log the aggregate status report
    pub async fn print_system_status(&self) {
        let status = self.system_status().await;

        info!("========== SYSTEM STATUS ==========");
        if let Some(scheduler) = &status.scheduler {
            info!(
                "Scheduler: {} | {} profiles | queue: {} pending, {} leased, {} retry, {} dead",
                if scheduler.running { "running" } else { "stopped" },
                scheduler.profiles_monitored,
                scheduler.queue_stats.pending,
                scheduler.queue_stats.leased,
                scheduler.queue_stats.retry,
                scheduler.queue_stats.dead
            );
        }
        for worker in &status.workers.details {
            info!(
                "Worker {}: {} {} ({} completed, {} success)",
                worker.id,
                if worker.running { "running" } else { "stopped" },
                worker.current_job.as_deref().map_or_else(|| "idle".to_string(), |key| format!("scraping {}", key)),
                worker.completed,
                format_rate(worker.success_rate())
            );
        }
        info!(
            "Totals: {} completed, {} failed, {} success",
            status.performance.total_completed,
            status.performance.total_failed,
            format_rate(status.performance.success_rate)
        );
    }

    /// Replace worker tasks that exited while the system is running
    async fn restart_crashed_workers(&self) -> usize {
        if self.state() != OrchestratorState::Running {
            return 0;
        }

        let mut workers = self.inner.workers.lock().await;
        let mut restarted = 0;
        for index in 0..workers.len() {
            if !workers[index].is_finished() {
                continue;
            }

            let id = workers[index].id();
            warn!("Worker {} exited unexpectedly, restarting", id);
            let crashed = std::mem::replace(&mut workers[index], self.spawn_worker(id));
            if let Err(e) = crashed.shutdown().await {
                error!("Worker {} crashed: {}", id, e);
            }
            restarted += 1;
        }
        restarted
    }

    async fn report_loop(self) {
        let period = self.inner.config.status_report_interval();
        let mut shutdown = self.inner.background_shutdown.subscribe();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.restart_crashed_workers().await;
                    self.print_system_status().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn signal_loop(self) {
        let mut shutdown = self.inner.background_shutdown.subscribe();

        tokio::select! {
            signal = shutdown_signal() => match signal {
                Ok(name) => {
                    info!("Received {}, stopping gracefully", name);
                    if let Err(e) = self.stop().await {
                        error!("Error during shutdown: {}", e);
                    }
                }
                Err(e) => error!("Failed to install signal handlers: {}", e),
            },
            _ = shutdown.changed() => {}
        }
    }

    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.inner.scheduler.read().clone()
    }

    fn set_state(&self, state: OrchestratorState) {
        self.inner.state.send_replace(state);
    }
}

/// Trim, drop empty keys and de-duplicate, keeping first occurrences
pub fn normalize_profiles<'a>(keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .filter(|key| seen.insert(key.to_string()))
        .map(str::to_string)
        .collect()
}

fn format_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "N/A".to_string(), |rate| format!("{:.1}%", rate))
}

#[cfg(unix)]
async fn shutdown_signal() -> QueueResult<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())
        .map_err(|e| QueueError::Internal(format!("SIGTERM handler: {}", e)))?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.map_err(|e| QueueError::Internal(format!("SIGINT handler: {}", e)))?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> QueueResult<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| QueueError::Internal(format!("SIGINT handler: {}", e)))?;
    Ok("SIGINT")
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use crate::{
        QueueConfig, ScrapeError, ScrapeReport, WorkerConfig, Job, LeasedJob, DeadLetter,
        FailedLease, Lane, QueueStats, RetryPolicy,
    };
    use crate::backend::{QueueBackend, memory::MemoryBackend};
    use crate::store::MemoryProfileStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct OkScraper;

    #[async_trait]
    impl Scraper for OkScraper {
        async fn scrape_profile(&self, _key: &str) -> Result<ScrapeReport, ScrapeError> {
            Ok(ScrapeReport::succeeded(1, 1, 1))
        }
    }

    fn test_config(workers: usize) -> SystemConfig {
        SystemConfig {
            workers: WorkerConfig::immediate(workers),
            ..SystemConfig::default()
        }
    }

    fn orchestrator(store: &MemoryProfileStore, profiles: &[&str]) -> Orchestrator {
        Orchestrator::new(
            test_config(2),
            JobQueue::memory(QueueConfig::default()),
            Arc::new(store.clone()),
            Arc::new(OkScraper),
            profiles.iter().map(|key| key.to_string()).collect(),
        )
        .without_signal_handling()
    }

    #[test]
    fn test_normalize_profiles() {
        let normalized = normalize_profiles([" alice ", "", "bob", "alice", "   "]);
        assert_eq!(normalized, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_initialize_fails_fast_on_store_outage() {
        let store = MemoryProfileStore::new();
        store.set_unavailable(true);
        let system = orchestrator(&store, &["alice"]);

        let result = system.initialize().await;

        assert!(matches!(result, Err(QueueError::Store(_))));
        assert_eq!(system.state(), OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_start_requires_initialize() {
        let system = orchestrator(&MemoryProfileStore::new(), &[]);
        assert!(matches!(system.start().await, Err(QueueError::InvalidState(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lifecycle_and_double_stop() {
        let store = MemoryProfileStore::new();
        store.track("alice");
        let system = orchestrator(&store, &[" alice ", "alice", "bob"]);

        system.initialize().await.unwrap();
        assert_eq!(system.state(), OrchestratorState::Initializing);
        assert_eq!(system.profiles(), vec!["alice", "bob"]);

        system.start().await.unwrap();
        assert_eq!(system.state(), OrchestratorState::Running);

        tokio::time::timeout(Duration::from_secs(5), async {
            while system.system_status().await.performance.total_completed < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let status = system.system_status().await;
        assert_eq!(status.workers.total, 2);
        assert_eq!(status.performance.success_rate, Some(100.0));
        assert!(status.scheduler.unwrap().running);

        system.stop().await.unwrap();
        assert_eq!(system.state(), OrchestratorState::Stopped);

        system.stop().await.unwrap();
        assert_eq!(system.state(), OrchestratorState::Stopped);
        assert!(logs_contain("System is not running"));
    }

    #[tokio::test]
    async fn test_restart_worker_by_id() {
        let system = orchestrator(&MemoryProfileStore::new(), &[]);
        system.initialize().await.unwrap();
        system.start().await.unwrap();

        assert!(system.restart_worker(2).await);
        assert!(!system.restart_worker(0).await);
        assert!(!system.restart_worker(3).await);

        let ids: Vec<_> = system.system_status().await.workers.details.iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 2]);

        system.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_and_remove_profiles() {
        let system = orchestrator(&MemoryProfileStore::new(), &["alice"]);

        assert_eq!(system.add_profiles(["alice", "bob", "carol", "bob"]), 2);
        assert_eq!(system.remove_profiles(["alice", "zed"]), 1);
        assert_eq!(system.profiles(), vec!["bob", "carol"]);
    }

    #[tokio::test]
    async fn test_wait_resolves_after_stop() {
        let system = orchestrator(&MemoryProfileStore::new(), &[]);
        system.initialize().await.unwrap();
        system.start().await.unwrap();

        let waiter = tokio::spawn({
            let system = system.clone();
            async move { system.wait().await }
        });

        system.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    /// Memory backend that counts `close` calls and can panic on failure reports
    #[derive(Clone, Default)]
    struct WatchedBackend {
        inner: MemoryBackend,
        closes: Arc<AtomicUsize>,
        fail_panics: bool,
    }

    #[async_trait]
    impl QueueBackend for WatchedBackend {
        async fn push_pending(&self, job: Job, score_ms: i64) -> QueueResult<bool> {
            self.inner.push_pending(job, score_ms).await
        }

        async fn lease_next(&self, now: DateTime<Utc>, until: DateTime<Utc>) -> QueueResult<Option<LeasedJob>> {
            self.inner.lease_next(now, until).await
        }

        async fn take_lease(&self, key: &str) -> QueueResult<Option<LeasedJob>> {
            self.inner.take_lease(key).await
        }

        async fn expired_leases(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
            self.inner.expired_leases(now).await
        }

        async fn fail_lease(
            &self,
            key: &str,
            error: &str,
            now: DateTime<Utc>,
            policy: &RetryPolicy,
        ) -> QueueResult<Option<FailedLease>> {
            if self.fail_panics {
                panic!("retry lane corrupted");
            }
            self.inner.fail_lease(key, error, now, policy).await
        }

        async fn reclaim_lease(
            &self,
            key: &str,
            error: &str,
            now: DateTime<Utc>,
            policy: &RetryPolicy,
        ) -> QueueResult<Option<FailedLease>> {
            self.inner.reclaim_lease(key, error, now, policy).await
        }

        async fn due_retries(&self, now: DateTime<Utc>) -> QueueResult<Vec<String>> {
            self.inner.due_retries(now).await
        }

        async fn promote_retry(&self, key: &str, now: DateTime<Utc>, score_ms: i64) -> QueueResult<bool> {
            self.inner.promote_retry(key, now, score_ms).await
        }

        async fn dead_letters(&self) -> QueueResult<Vec<DeadLetter>> {
            self.inner.dead_letters().await
        }

        async fn lane_of(&self, key: &str) -> QueueResult<Option<Lane>> {
            self.inner.lane_of(key).await
        }

        async fn stats(&self) -> QueueResult<QueueStats> {
            self.inner.stats().await
        }

        async fn ping(&self) -> QueueResult<()> {
            self.inner.ping().await
        }

        async fn close(&self) -> QueueResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }

        fn name(&self) -> &'static str {
            "watched"
        }
    }

    struct SlowScraper(Duration);

    #[async_trait]
    impl Scraper for SlowScraper {
        async fn scrape_profile(&self, _key: &str) -> Result<ScrapeReport, ScrapeError> {
            tokio::time::sleep(self.0).await;
            Ok(ScrapeReport::succeeded(1, 1, 1))
        }
    }

    struct BlockedScraper;

    #[async_trait]
    impl Scraper for BlockedScraper {
        async fn scrape_profile(&self, key: &str) -> Result<ScrapeReport, ScrapeError> {
            Err(ScrapeError::Blocked(format!("{} requires login", key)))
        }
    }

    /// Records the orchestrator state seen at every scrape
    #[derive(Default)]
    struct StateRecordingScraper {
        system: OnceLock<Orchestrator>,
        seen: Mutex<Vec<OrchestratorState>>,
    }

    #[async_trait]
    impl Scraper for StateRecordingScraper {
        async fn scrape_profile(&self, _key: &str) -> Result<ScrapeReport, ScrapeError> {
            if let Some(system) = self.system.get() {
                self.seen.lock().push(system.state());
            }
            Ok(ScrapeReport::succeeded(0, 0, 0))
        }
    }

    fn system_with(
        config: SystemConfig,
        queue: JobQueue,
        store: &MemoryProfileStore,
        scraper: Arc<dyn Scraper>,
    ) -> Orchestrator {
        Orchestrator::new(config, queue, Arc::new(store.clone()), scraper, Vec::new())
            .without_signal_handling()
    }

    #[tokio::test]
    async fn test_double_stop_closes_queue_once() {
        let backend = WatchedBackend::default();
        let system = system_with(
            test_config(2),
            JobQueue::new(backend.clone(), QueueConfig::default()),
            &MemoryProfileStore::new(),
            Arc::new(OkScraper),
        );

        system.initialize().await.unwrap();
        system.start().await.unwrap();
        system.stop().await.unwrap();
        system.stop().await.unwrap();

        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_does_not_block_status() {
        let store = MemoryProfileStore::new();
        store.track("alice");
        let system = system_with(
            test_config(1),
            JobQueue::memory(QueueConfig::default()),
            &store,
            Arc::new(SlowScraper(Duration::from_secs(30))),
        );
        system.initialize().await.unwrap();
        system.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = system.system_status().await;
        assert_eq!(before.workers.details[0].current_job.as_deref(), Some("alice"));

        let restart = tokio::spawn({
            let system = system.clone();
            async move { system.restart_worker(1).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        // the old worker is still scraping, yet the pool answers
        let status = tokio::time::timeout(Duration::from_secs(1), system.system_status())
            .await
            .expect("status blocked behind a restart");
        assert_eq!(status.workers.total, 1);
        assert_eq!(status.workers.details[0].current_job, None);

        assert!(restart.await.unwrap());
        assert!(store.last_scraped("alice").is_some());

        system.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_report_loop_restarts_crashed_worker() {
        let store = MemoryProfileStore::new();
        store.track("doomed");
        let backend = WatchedBackend {
            fail_panics: true,
            ..WatchedBackend::default()
        };
        let system = system_with(
            test_config(1),
            JobQueue::new(backend, QueueConfig::default()),
            &store,
            Arc::new(BlockedScraper),
        );
        system.initialize().await.unwrap();
        system.start().await.unwrap();

        // both the failure report and its recovery panic, so the task dies
        tokio::time::sleep(Duration::from_secs(1)).await;
        let crashed = system.system_status().await;
        assert_eq!(crashed.workers.details[0].current_job.as_deref(), Some("doomed"));

        tokio::time::sleep(Duration::from_secs(30 * 60 + 1)).await;

        assert!(logs_contain("Worker 1 exited unexpectedly, restarting"));
        let restarted = system.system_status().await;
        assert_eq!(restarted.workers.total, 1);
        assert_eq!(restarted.workers.details[0].id, 1);
        assert!(restarted.workers.details[0].running);
        assert_eq!(restarted.workers.details[0].current_job, None);

        system.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_workers_only_scrape_while_running() {
        let store = MemoryProfileStore::new();
        store.track("alice");
        let mut config = test_config(2);
        config.workers.spawn_stagger_ms = 50;

        let scraper = Arc::new(StateRecordingScraper::default());
        let system = system_with(config, JobQueue::memory(QueueConfig::default()), &store, scraper.clone());
        let _ = scraper.system.set(system.clone());

        system.initialize().await.unwrap();
        system.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.last_scraped("alice").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*scraper.seen.lock(), vec![OrchestratorState::Running]);
        system.stop().await.unwrap();
    }
}
