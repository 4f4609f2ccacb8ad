use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};

/// Live counters for queue operations
#[derive(Debug, Default)]
pub struct LiveMetrics {
    jobs_enqueued: AtomicU64,
    jobs_leased: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_requeued: AtomicU64,
    jobs_reclaimed: AtomicU64,
    jobs_dead_lettered: AtomicU64,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_enqueued(&self) {
        self.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_leased(&self) {
        self.jobs_leased.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_requeued(&self) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_reclaimed(&self) {
        self.jobs_reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_dead_lettered(&self) {
        self.jobs_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.jobs_enqueued.load(Ordering::Relaxed),
            leased: self.jobs_leased.load(Ordering::Relaxed),
            completed: self.jobs_completed.load(Ordering::Relaxed),
            retried: self.jobs_retried.load(Ordering::Relaxed),
            requeued: self.jobs_requeued.load(Ordering::Relaxed),
            reclaimed: self.jobs_reclaimed.load(Ordering::Relaxed),
            dead_lettered: self.jobs_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub leased: u64,
    pub completed: u64,
    pub retried: u64,
    pub requeued: u64,
    pub reclaimed: u64,
    pub dead_lettered: u64,
}

impl MetricsSnapshot {
    /// Completed share of finished jobs; `None` before anything finished
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.completed + self.dead_lettered;
        if finished == 0 {
            None
        } else {
            Some(self.completed as f64 / finished as f64 * 100.0)
        }
    }

    /// Retries per lease, as a percentage
    pub fn retry_rate(&self) -> f64 {
        if self.leased == 0 {
            0.0
        } else {
            self.retried as f64 / self.leased as f64 * 100.0
        }
    }
}
