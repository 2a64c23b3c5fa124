use crate::models::backup_run::{self, BackupRun};
use crate::state::AppState;
use backup_core::events::BackupEvent;
use backup_core::history::{HistoryItem, HISTORY_CAPACITY};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Run record for events that finish a backup; `None` for everything else.
pub fn run_from_event(event: &BackupEvent) -> Option<BackupRun> {
    let now = chrono::Utc::now();
    match event {
        BackupEvent::BackupCompleted {
            run_id,
            schedule_id,
            duration_ms,
            metadata,
        } => Some(BackupRun {
            id: run_id.clone(),
            item: HistoryItem {
                timestamp: now,
                schedule_id: schedule_id.clone(),
                backup_type: metadata.backup_type,
                filename: Some(metadata.filename.clone()),
                success: true,
                duration_ms: *duration_ms,
                size: metadata.size,
                error: None,
                metadata: Some(metadata.clone()),
            },
            error_kind: None,
        }),
        BackupEvent::BackupFailed {
            run_id,
            schedule_id,
            backup_type,
            duration_ms,
            error,
            kind,
        } => Some(BackupRun {
            id: run_id.clone(),
            item: HistoryItem {
                timestamp: now,
                schedule_id: schedule_id.clone(),
                backup_type: *backup_type,
                filename: None,
                success: false,
                duration_ms: *duration_ms,
                size: 0,
                error: Some(error.clone()),
                metadata: None,
            },
            error_kind: Some(kind.clone()),
        }),
        _ => None,
    }
}

/// Forward manager events to WebSocket clients and persist finished runs.
pub fn start_event_relay(state: Arc<AppState>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut rx = state.manager.events().subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Event relay lagged, {} events dropped", n);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            state.ui.broadcast_event(&event);

            if let Some(run) = run_from_event(&event) {
                let db = state.db.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let conn = db.get()?;
                    backup_run::insert(&conn, &run)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Failed to record backup run: {:#}", e),
                    Err(e) => tracing::warn!("Run recorder task failed: {}", e),
                }
            }
        }
        tracing::info!("Event relay stopped");
    })
}

/// Seed the in-memory run history from the persisted runs, oldest first.
pub async fn preload_history(state: &AppState) -> anyhow::Result<usize> {
    let db = state.db.clone();
    let mut items = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_run::find_recent(&conn, HISTORY_CAPACITY as i64)
    })
    .await??;

    items.reverse();
    let history = state.manager.history();
    let count = items.len();
    for item in items {
        history.push(item);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support;
    use backup_core::manager::CreateRequest;
    use backup_core::metadata::BackupType;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_runs_are_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let (db, state) = test_support::state(&dir);
        let cancel = CancellationToken::new();
        let relay = start_event_relay(state.clone(), cancel.clone());
        let mut ws = state.ui.subscribe();

        let token = CancellationToken::new();
        state
            .manager
            .create_backup(CreateRequest::new("ok", BackupType::Manual), &token)
            .await
            .unwrap();
        db.set_broken(true);
        assert!(state
            .manager
            .create_backup(CreateRequest::new("bad", BackupType::Manual), &token)
            .await
            .is_err());

        // started, completed, started, failed
        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(5), ws.recv()).await.unwrap().unwrap();
        }

        let mut persisted = Vec::new();
        for _ in 0..100 {
            let conn = state.db.get().unwrap();
            persisted = backup_run::find_recent(&conn, 10).unwrap();
            if persisted.len() == 2 {
                break;
            }
            drop(conn);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted.iter().filter(|r| r.success).count(), 1);

        cancel.cancel();
        relay.await.unwrap();

        let dir2 = TempDir::new().unwrap();
        let (_db, fresh) = test_support::state(&dir2);
        {
            let conn = fresh.db.get().unwrap();
            for item in persisted {
                backup_run::insert(
                    &conn,
                    &BackupRun {
                        id: uuid::Uuid::new_v4().to_string(),
                        item,
                        error_kind: None,
                    },
                )
                .unwrap();
            }
        }
        assert_eq!(preload_history(&fresh).await.unwrap(), 2);
        assert_eq!(fresh.manager.history().counts().total, 2);
    }
}
