use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RunId;

/// Structured lifecycle events emitted by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job entered the pending lane
    Enqueued {
        key: String,
        run_id: RunId,
        priority: i64,
        at: DateTime<Utc>,
    },

    /// Job was leased by a worker
    Leased {
        key: String,
        run_id: RunId,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Completed {
        key: String,
        at: DateTime<Utc>,
    },

    /// Job failed and was scheduled for another attempt
    Retrying {
        key: String,
        run_id: RunId,
        attempts: u32,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Retry became due and moved back to pending
    Requeued {
        key: String,
        at: DateTime<Utc>,
    },

    /// An expired lease was reclaimed
    Reclaimed {
        key: String,
        run_id: RunId,
        lease_until: DateTime<Utc>,
        at: DateTime<Utc>,
    },

    /// Job exhausted its retries and was dead-lettered
    DeadLettered {
        key: String,
        run_id: RunId,
        attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Leased { .. } => "leased",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Requeued { .. } => "requeued",
            Self::Reclaimed { .. } => "reclaimed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    /// Get the profile key from any event
    pub fn key(&self) -> &str {
        match self {
            Self::Enqueued { key, .. }
            | Self::Leased { key, .. }
            | Self::Completed { key, .. }
            | Self::Retrying { key, .. }
            | Self::Requeued { key, .. }
            | Self::Reclaimed { key, .. }
            | Self::DeadLettered { key, .. } => key,
        }
    }

    /// Check whether the event ends the job's life in the queue
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::DeadLettered { .. })
    }
}
