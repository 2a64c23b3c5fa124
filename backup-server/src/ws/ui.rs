use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use backup_core::events::BackupEvent;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::state::AppState;

const BROADCAST_CAPACITY: usize = 256;
const MAX_REPLAY: usize = 100;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub event_type: String,
    pub payload: Value,
    pub timestamp: i64,
}

impl QueuedMessage {
    fn to_json(&self) -> String {
        serde_json::json!({
            "type": self.event_type,
            "payload": self.payload,
            "timestamp": self.timestamp,
        })
        .to_string()
    }
}

/// Fan-out of `{type, payload, timestamp}` messages to WebSocket clients,
/// keeping the most recent ones for replay after a reconnect.
#[derive(Clone)]
pub struct UiBroadcaster {
    tx: broadcast::Sender<String>,
    queue: Arc<Mutex<VecDeque<QueuedMessage>>>,
}

impl Default for UiBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl UiBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, event_type: &str, payload: Value) {
        let msg = QueuedMessage {
            event_type: event_type.to_string(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let msg_str = msg.to_json();

        // Queue backup lifecycle messages for replay
        if !event_type.starts_with("health:") {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push_back(msg);
            if queue.len() > MAX_REPLAY {
                queue.pop_front();
            }
        }

        let _ = self.tx.send(msg_str);
    }

    pub fn broadcast_event(&self, event: &BackupEvent) {
        match serde_json::to_value(event) {
            Ok(Value::Object(mut obj)) => {
                let payload = obj.remove("payload").unwrap_or(Value::Null);
                self.broadcast(event.event_type(), payload);
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to serialize {} event: {}", event.event_type(), e),
        }
    }

    pub fn get_queued_messages(&self, since: i64) -> Vec<QueuedMessage> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.timestamp > since)
            .cloned()
            .collect()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.ui.subscribe();
    let (replay_tx, mut replay_rx) = tokio::sync::mpsc::channel::<String>(MAX_REPLAY);

    // Forward broadcasts, and replays for this client only
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("WebSocket client lagged, {} messages dropped", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(msg) = replay_rx.recv() => msg,
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages from client (replay:request)
    let ui = state.ui.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else { continue };
            let Ok(parsed) = serde_json::from_str::<Value>(&text) else { continue };
            if parsed.get("type").and_then(|t| t.as_str()) != Some("replay:request") {
                continue;
            }
            let since = parsed
                .get("payload")
                .and_then(|p| p.get("since"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            for m in ui.get_queued_messages(since) {
                if replay_tx.send(m.to_json()).await.is_err() {
                    return;
                }
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::events::BackupEvent;

    #[tokio::test]
    async fn test_event_shape_and_replay() {
        let ui = UiBroadcaster::new();
        let mut rx = ui.subscribe();

        ui.broadcast_event(&BackupEvent::RestoreStarted {
            filename: "manual_backup_20250101_000000_abcdef01.sql.gz".into(),
        });
        ui.broadcast("health:updated", serde_json::json!({ "overall": "UP" }));

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "restore:started");
        assert_eq!(first["payload"]["filename"], "manual_backup_20250101_000000_abcdef01.sql.gz");
        assert!(first["timestamp"].as_i64().unwrap() > 0);

        let replay = ui.get_queued_messages(0);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event_type, "restore:started");
        assert!(ui.get_queued_messages(i64::MAX).is_empty());
    }
}
