//! User notifications
//!
//! `notify` is fire-and-forget: the row is stored and the event published,
//! and any failure is logged without failing the calling operation.

use crate::events::{AgoraEvent, EventBus, NotificationKind};
use crate::time::{now, to_millis};
use crate::Result;
use sqlx::SqlitePool;

/// Stores notifications and publishes them on the event bus
#[derive(Clone)]
pub struct Notifier {
    db: SqlitePool,
    event_bus: EventBus,
}

impl Notifier {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    /// Notify `user_id`; never fails the caller
    pub async fn notify(&self, user_id: &str, kind: NotificationKind, payload: serde_json::Value) {
        if let Err(e) = self.try_notify(user_id, kind, payload).await {
            tracing::warn!(
                user_id,
                kind = kind.as_str(),
                error = %e,
                "Failed to deliver notification"
            );
        }
    }

    async fn try_notify(
        &self,
        user_id: &str,
        kind: NotificationKind,
        payload: serde_json::Value,
    ) -> Result<()> {
        let timestamp = now();

        let notification_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO notifications (user_id, kind, payload, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(kind.as_str())
        .bind(payload.to_string())
        .bind(to_millis(timestamp))
        .fetch_one(&self.db)
        .await?;

        self.event_bus.emit_lossy(AgoraEvent::Notification {
            notification_id,
            user_id: user_id.to_string(),
            kind,
            payload,
            timestamp,
        });

        Ok(())
    }
}
