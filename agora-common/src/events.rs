//! In-process event bus
//!
//! Services publish pipeline events on a `tokio::sync::broadcast` channel.
//! Delivery to end users (SSE, push) is a separate transport that subscribes
//! here; nothing in the pipeline waits on subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Kind of user-facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ImportCompleted,
    ImportFailed,
    ExportStarted,
    ExportCompleted,
    ExportFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ImportCompleted => "import_completed",
            NotificationKind::ImportFailed => "import_failed",
            NotificationKind::ExportStarted => "export_started",
            NotificationKind::ExportCompleted => "export_completed",
            NotificationKind::ExportFailed => "export_failed",
        }
    }
}

/// Agora pipeline events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgoraEvent {
    /// A notification was stored for a user
    Notification {
        notification_id: i64,
        user_id: String,
        kind: NotificationKind,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// A conversation's clustering result was replaced
    MathUpdated {
        conversation_id: i64,
        math_result_id: i64,
        cluster_count: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`AgoraEvent`]
///
/// Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgoraEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus; `capacity` events are buffered per slow
    /// subscriber before the oldest are dropped
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AgoraEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; `Err` when nobody is subscribed
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: AgoraEvent) -> Result<usize, broadcast::error::SendError<AgoraEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AgoraEvent) {
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

    fn math_event() -> AgoraEvent {
        AgoraEvent::MathUpdated {
            conversation_id: 7,
            math_result_id: 1,
            cluster_count: 2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::new(10);
        assert!(bus.emit(math_event()).is_err());
        bus.emit_lossy(math_event());
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(math_event()).unwrap();

        match rx.recv().await.unwrap() {
            AgoraEvent::MathUpdated { conversation_id, .. } => assert_eq!(conversation_id, 7),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(math_event()).unwrap();
        assert_eq!(json["type"], "MathUpdated");
    }
}
