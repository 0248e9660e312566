//! Pipeline event types and the broadcast EventBus
//!
//! Events are broadcast to every subscriber and serialized for SSE transmission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Pipeline events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Ingestion job moved CREATED → RUNNING
    JobStarted {
        job_id: String,
        source: String,
        timestamp: DateTime<Utc>,
    },

    /// Periodic counters during ingestion (emitted on each metrics flush)
    JobProgress {
        job_id: String,
        received: u64,
        processed: u64,
        failed: u64,
        timestamp: DateTime<Utc>,
    },

    /// Source exhausted (or stop requested) without fatal error
    JobCompleted {
        job_id: String,
        received: u64,
        processed: u64,
        failed: u64,
        stopped: bool,
        timestamp: DateTime<Utc>,
    },

    /// Fatal configuration or connector error
    JobFailed {
        job_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A normalization result landed in the review band
    ReviewQueued {
        job_id: String,
        field_path: String,
        source_value: String,
        confidence: f32,
        timestamp: DateTime<Utc>,
    },

    /// Human decision applied to a review entry
    ReviewDecided {
        job_id: String,
        field_path: String,
        source_value: String,
        decision: String,
        approver: String,
        timestamp: DateTime<Utc>,
    },

    /// Persistence run finished
    PersistenceCompleted {
        job_id: String,
        table: String,
        inserted: u64,
        updated_or_skipped: u64,
        total_records_found: u64,
        source_used: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Event type name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::JobStarted { .. } => "JobStarted",
            PipelineEvent::JobProgress { .. } => "JobProgress",
            PipelineEvent::JobCompleted { .. } => "JobCompleted",
            PipelineEvent::JobFailed { .. } => "JobFailed",
            PipelineEvent::ReviewQueued { .. } => "ReviewQueued",
            PipelineEvent::ReviewDecided { .. } => "ReviewDecided",
            PipelineEvent::PersistenceCompleted { .. } => "PersistenceCompleted",
        }
    }

    /// Job the event belongs to
    pub fn job_id(&self) -> &str {
        match self {
            PipelineEvent::JobStarted { job_id, .. }
            | PipelineEvent::JobProgress { job_id, .. }
            | PipelineEvent::JobCompleted { job_id, .. }
            | PipelineEvent::JobFailed { job_id, .. }
            | PipelineEvent::ReviewQueued { job_id, .. }
            | PipelineEvent::ReviewDecided { job_id, .. }
            | PipelineEvent::PersistenceCompleted { job_id, .. } => job_id,
        }
    }
}

/// Broadcast bus shared by the pipeline services and the SSE endpoint
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; `Err` when no subscriber is listening
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: PipelineEvent,
    ) -> Result<usize, broadcast::error::SendError<PipelineEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(PipelineEvent::JobFailed {
            job_id: "job-1".to_string(),
            error: "connector closed".to_string(),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "JobFailed");
        assert_eq!(event.job_id(), "job-1");
    }

    #[test]
    fn test_emit_without_subscribers_is_error() {
        let bus = EventBus::new(4);
        let result = bus.emit(PipelineEvent::JobStarted {
            job_id: "j".to_string(),
            source: "memory".to_string(),
            timestamp: Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_serialized_event_is_tagged() {
        let event = PipelineEvent::ReviewQueued {
            job_id: "j".to_string(),
            field_path: "diagnosis_code".to_string(),
            source_value: "E11".to_string(),
            confidence: 0.7,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ReviewQueued");
        assert_eq!(json["field_path"], "diagnosis_code");
    }
}
