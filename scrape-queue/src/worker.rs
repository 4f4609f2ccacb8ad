//! Scrape workers: lease a job, wait out the anti-burst delay, scrape, report.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    QueueResult, QueueError, WorkerConfig, Job, ScrapeError,
    queue::JobQueue,
    scraper::Scraper,
    store::ProfileStore,
};

/// Live counters for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: usize,
    pub running: bool,
    pub current_job: Option<String>,
    pub completed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            running: false,
            current_job: None,
            completed: 0,
            failed: 0,
            started_at: Utc::now(),
        }
    }

    /// Percentage of finished jobs that succeeded; `None` before the first one
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.completed + self.failed;
        if total == 0 {
            None
        } else {
            Some(self.completed as f64 / total as f64 * 100.0)
        }
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    id: usize,
    shutdown_tx: watch::Sender<bool>,
    join_handle: JoinHandle<QueueResult<()>>,
    status: Arc<RwLock<WorkerStatus>>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    /// Ask the worker to stop after its current job without waiting for it
    pub fn signal_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// True once the worker task has exited, cleanly or not
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Gracefully shutdown the worker
    pub async fn shutdown(self) -> QueueResult<()> {
        self.signal_stop();
        let id = self.id;
        self.join_handle
            .await
            .map_err(|e| QueueError::Internal(format!("Worker {} join error: {}", id, e)))?
    }
}

/// A single scrape worker
pub struct Worker {
    id: usize,
    queue: JobQueue,
    scraper: Arc<dyn Scraper>,
    store: Arc<dyn ProfileStore>,
    config: WorkerConfig,
    max_retries: u32,
    status: Arc<RwLock<WorkerStatus>>,
}

impl Worker {
    pub fn new(
        id: usize,
        queue: JobQueue,
        scraper: Arc<dyn Scraper>,
        store: Arc<dyn ProfileStore>,
        config: WorkerConfig,
    ) -> Self {
        let max_retries = queue.config().max_retries;
        Self {
            id,
            queue,
            scraper,
            store,
            config,
            max_retries,
            status: Arc::new(RwLock::new(WorkerStatus::new(id))),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    /// Run the worker loop on its own task
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = self.id;
        let status = self.status.clone();

        let join_handle = tokio::spawn(async move { self.run(shutdown_rx).await });

        WorkerHandle {
            id,
            shutdown_tx,
            join_handle,
            status,
        }
    }

    /// Main worker loop; returns once shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> QueueResult<()> {
        info!("Worker {}: Starting worker loop", self.id);
        self.status.write().running = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let Some(job) = self.queue.get_next_job().await else {
                if self.pause(self.config.poll_interval(), &mut shutdown).await {
                    break;
                }
                continue;
            };

            self.status.write().current_job = Some(job.key.clone());

            let outcome = AssertUnwindSafe(self.handle_job(&job)).catch_unwind().await;
            if let Err(panic) = outcome {
                let message = panic_message(panic.as_ref());
                error!("Worker {}: Unexpected error while processing {}: {}", self.id, job.key, message);

                self.queue.fail_job(&job.key, &message, self.max_retries).await;
                {
                    let mut status = self.status.write();
                    status.failed += 1;
                    status.current_job = None;
                }

                if self.pause(self.config.recovery_delay(), &mut shutdown).await {
                    break;
                }
                continue;
            }

            self.status.write().current_job = None;

            if self.pause(self.config.inter_job_delay(), &mut shutdown).await {
                break;
            }
        }

        {
            let mut status = self.status.write();
            status.running = false;
            status.current_job = None;
        }
        info!("Worker {}: Stopped", self.id);
        Ok(())
    }

    async fn handle_job(&self, job: &Job) -> bool {
        let delay = self.jitter();
        if !delay.is_zero() {
            info!(
                "Worker {}: Waiting {:.1}s before processing {}",
                self.id,
                delay.as_secs_f64(),
                job.key
            );
            tokio::time::sleep(delay).await;
        }

        self.process_job(job).await
    }

    /// Scrape one profile and report the outcome to the queue
    #[instrument(skip(self, job), fields(worker_id = self.id, key = %job.key, run_id = %job.run_id))]
    async fn process_job(&self, job: &Job) -> bool {
        let started = Instant::now();
        info!("Worker {}: Starting scrape for {}", self.id, job.key);

        let outcome = AssertUnwindSafe(self.scraper.scrape_profile(&job.key))
            .catch_unwind()
            .await;

        self.scraper.release(&job.key).await;

        let result = outcome.unwrap_or_else(|panic| {
            Err(ScrapeError::Failed(format!("Scraper panicked: {}", panic_message(panic.as_ref()))))
        });

        match result {
            Ok(report) if report.success => {
                match self.store.update_last_scraped(&job.key).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Worker {}: {} is not a tracked profile", self.id, job.key),
                    Err(e) => error!("Worker {}: Error updating last_scraped for {}: {}", self.id, job.key, e),
                }

                info!(
                    "Worker {}: Completed {} in {:.1}s (videos: {}, music: {}, tags: {})",
                    self.id,
                    job.key,
                    started.elapsed().as_secs_f64(),
                    report.videos,
                    report.musics,
                    report.tags
                );

                self.queue.complete_job(&job.key).await;
                self.status.write().completed += 1;
                true
            }
            Ok(report) => self.record_failure(job, &report.failure_message(), started).await,
            Err(e) => self.record_failure(job, &e.message(), started).await,
        }
    }

    async fn record_failure(&self, job: &Job, message: &str, started: Instant) -> bool {
        error!(
            "Worker {}: Failed {} after {:.1}s: {}",
            self.id,
            job.key,
            started.elapsed().as_secs_f64(),
            message
        );

        self.queue.fail_job(&job.key, message, self.max_retries).await;
        self.status.write().failed += 1;
        false
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.config.jitter_min_ms, self.config.jitter_max_ms);
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Sleep unless shutdown arrives first. Returns `true` when the worker should stop.
    async fn pause(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return *shutdown.borrow();
        }

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown.changed() => true,
        };

        if interrupted {
            debug!("Worker {}: Shutdown received while waiting", self.id);
            return true;
        }
        *shutdown.borrow()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
