use std::pin::Pin;
use std::sync::Arc;
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::debug;

use crate::JobEvent;
use super::{LiveMetrics, MetricsSnapshot};

/// Event broadcaster plus live counters for the queue
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<LiveMetrics>,
}

impl ObservabilityLayer {
    /// Create new observability layer
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(1000);

        Self {
            event_broadcaster,
            metrics: Arc::new(LiveMetrics::new()),
        }
    }

    /// Count and broadcast an event; lagging or absent subscribers are ignored
    pub fn record(&self, event: JobEvent) {
        match &event {
            JobEvent::Enqueued { .. } => self.metrics.increment_jobs_enqueued(),
            JobEvent::Leased { .. } => self.metrics.increment_jobs_leased(),
            JobEvent::Completed { .. } => self.metrics.increment_jobs_completed(),
            JobEvent::Retrying { .. } => self.metrics.increment_jobs_retried(),
            JobEvent::Requeued { .. } => self.metrics.increment_jobs_requeued(),
            JobEvent::Reclaimed { .. } => self.metrics.increment_jobs_reclaimed(),
            JobEvent::DeadLettered { .. } => self.metrics.increment_jobs_dead_lettered(),
        }

        debug!("Recorded {} event for {}", event.event_name(), event.key());
        let _ = self.event_broadcaster.send(event);
    }

    /// Subscribe to the raw event channel
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_broadcaster.subscribe()
    }

    /// Event stream that skips over lagged messages
    pub fn event_stream(&self) -> Pin<Box<dyn Stream<Item = JobEvent> + Send>> {
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe())
            .filter_map(|event| event.ok());
        Box::pin(stream)
    }

    /// Get live metrics
    pub fn metrics(&self) -> &LiveMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_record_counts_and_broadcasts() {
        let layer = ObservabilityLayer::new();
        let mut events = layer.subscribe();

        layer.record(JobEvent::Completed { key: "alice".to_string(), at: Utc::now() });

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_name(), "completed");
        assert_eq!(event.key(), "alice");
        assert_eq!(layer.snapshot().completed, 1);
    }

    #[tokio::test]
    async fn test_event_stream_yields_recorded_events() {
        let layer = ObservabilityLayer::new();
        let mut stream = layer.event_stream();

        layer.record(JobEvent::Requeued { key: "carol".to_string(), at: Utc::now() });

        let event = stream.next().await.unwrap();
        assert_eq!(event.key(), "carol");
    }

    #[test]
    fn test_record_without_subscribers() {
        let layer = ObservabilityLayer::new();
        layer.record(JobEvent::Requeued { key: "bob".to_string(), at: Utc::now() });
        assert_eq!(layer.snapshot().requeued, 1);
    }
}
