//! Structured event stream for an external monitoring sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackupEventKind {
    /// A job run began
    JobStarted {
        /// Job identifier
        job_id: String,
        /// Identifier of this run
        backup_id: String,
    },
    /// A job run finished, successfully or not
    JobCompleted {
        /// Job identifier
        job_id: String,
        /// Identifier of this run
        backup_id: String,
        /// Overall outcome
        success: bool,
        /// Files captured
        total_files: u64,
        /// Source bytes captured
        total_size: u64,
        /// Top-level failure, if any
        error: Option<String>,
    },
    /// A restore batch finished
    RestoreCompleted {
        /// Files written
        files_restored: u64,
        /// Bytes written
        total_size_restored: u64,
        /// Targets or files that failed
        errors: usize,
    },
    /// A manifest was checked against a tree
    VerificationCompleted {
        /// Manifest checked
        backup_id: String,
        /// Valid over total, in [0, 1]
        health_score: f64,
    },
    /// A destination rejected or timed out a write
    StorageFailure {
        /// Destination name
        destination: String,
        /// Description of the failure
        reason: String,
    },
    /// A run left one or more destinations without a complete copy
    ReplicationFailure {
        /// Identifier of the run
        backup_id: String,
        /// Destinations that failed
        destinations: Vec<String>,
    },
}

/// A timestamped event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEvent {
    /// When the event was raised
    pub timestamp: DateTime<Utc>,
    /// Payload
    #[serde(flatten)]
    pub kind: BackupEventKind,
}

impl BackupEvent {
    /// Stamp an event with the current time.
    pub fn new(kind: BackupEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// True for failure notifications
    pub fn is_failure(&self) -> bool {
        match &self.kind {
            BackupEventKind::StorageFailure { .. } | BackupEventKind::ReplicationFailure { .. } => {
                true
            }
            BackupEventKind::JobCompleted { success, .. } => !success,
            _ => false,
        }
    }
}

/// Receives engine events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: BackupEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: BackupEvent) {}
}

/// Fans events out to any number of subscribers over a broadcast channel.
///
/// Publishing never waits: slow subscribers lag and lose the oldest events.
/// Every event is also logged.
pub struct EventBus {
    sender: broadcast::Sender<BackupEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus that buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Send to every current subscriber; returns how many received it.
    pub fn publish(&self, event: BackupEvent) -> usize {
        if event.is_failure() {
            warn!(event = ?event.kind, "backup event");
        } else {
            info!(event = ?event.kind, "backup event");
        }
        if self.sender.receiver_count() == 0 {
            return 0;
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// New subscription starting at the next published event
    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.sender.subscribe()
    }

    /// Live subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-subscriber buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: BackupEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started() -> BackupEvent {
        BackupEvent::new(BackupEventKind::JobStarted {
            job_id: "job".into(),
            backup_id: "job-1".into(),
        })
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(started()), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.publish(started()), 2);
        assert_eq!(a.recv().await.unwrap().kind, started().kind);
        assert_eq!(b.recv().await.unwrap().kind, started().kind);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(started());
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
    }

    #[test]
    fn test_failure_classification() {
        let failed = BackupEvent::new(BackupEventKind::JobCompleted {
            job_id: "j".into(),
            backup_id: "b".into(),
            success: false,
            total_files: 0,
            total_size: 0,
            error: Some("source unreadable".into()),
        });
        assert!(failed.is_failure());
        assert!(!started().is_failure());
        let storage = BackupEvent::new(BackupEventKind::StorageFailure {
            destination: "nas".into(),
            reason: "timeout".into(),
        });
        assert!(storage.is_failure());
    }

    #[test]
    fn test_event_json_shape() {
        let event = BackupEvent::new(BackupEventKind::VerificationCompleted {
            backup_id: "b".into(),
            health_score: 0.5,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "verification_completed");
        assert_eq!(json["health_score"], 0.5);
        let back: BackupEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
