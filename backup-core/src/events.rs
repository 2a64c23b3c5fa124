//! Lifecycle events published by the manager.

use crate::executor::RestoreStats;
use crate::metadata::{BackupMetadata, BackupType};
use crate::retention::SweepReport;
use serde::Serialize;
use tokio::sync::broadcast;

/// Maximum number of queued events per subscriber
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    #[serde(rename = "backup:started", rename_all = "camelCase")]
    BackupStarted {
        run_id: String,
        backup_type: BackupType,
        schedule_id: Option<String>,
        description: String,
    },

    #[serde(rename = "backup:completed", rename_all = "camelCase")]
    BackupCompleted {
        run_id: String,
        schedule_id: Option<String>,
        duration_ms: u64,
        metadata: BackupMetadata,
    },

    #[serde(rename = "backup:failed", rename_all = "camelCase")]
    BackupFailed {
        run_id: String,
        schedule_id: Option<String>,
        backup_type: BackupType,
        duration_ms: u64,
        error: String,
        kind: String,
    },

    #[serde(rename = "restore:started", rename_all = "camelCase")]
    RestoreStarted { filename: String },

    #[serde(rename = "restore:completed", rename_all = "camelCase")]
    RestoreCompleted {
        filename: String,
        duration_ms: u64,
        stats: RestoreStats,
    },

    #[serde(rename = "restore:failed", rename_all = "camelCase")]
    RestoreFailed {
        filename: String,
        error: String,
        kind: String,
        rolled_back: bool,
    },

    #[serde(rename = "retention:completed")]
    SweepCompleted(SweepReport),
}

impl BackupEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BackupEvent::BackupStarted { .. } => "backup:started",
            BackupEvent::BackupCompleted { .. } => "backup:completed",
            BackupEvent::BackupFailed { .. } => "backup:failed",
            BackupEvent::RestoreStarted { .. } => "restore:started",
            BackupEvent::RestoreCompleted { .. } => "restore:completed",
            BackupEvent::RestoreFailed { .. } => "restore:failed",
            BackupEvent::SweepCompleted(_) => "retention:completed",
        }
    }
}

/// Fan-out of [`BackupEvent`]s. Publishing never blocks and never fails.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BackupEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: BackupEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = BackupEvent::RestoreStarted {
            filename: "a.sql".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "restore:started");
        assert_eq!(json["payload"]["filename"], "a.sql");
        assert_eq!(event.event_type(), "restore:started");

        let failed = BackupEvent::BackupFailed {
            run_id: "r1".into(),
            schedule_id: None,
            backup_type: BackupType::Automatic,
            duration_ms: 12,
            error: "boom".into(),
            kind: "tool_failed".into(),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["payload"]["runId"], "r1");
        assert_eq!(json["payload"]["backupType"], "automatic");
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(BackupEvent::RestoreStarted {
            filename: "a.sql".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "restore:started");
    }
}
