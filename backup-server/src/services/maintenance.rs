use crate::state::AppState;
use backup_core::health::HealthState;
use backup_core::BackupError;
use std::sync::Arc;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodic retention sweep, orphan collection and health refresh.
pub fn start_maintenance(state: Arc<AppState>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cleanup_every = state.config.cleanup_interval;
        let mut cleanup = interval_at(Instant::now() + cleanup_every, cleanup_every);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(state.config.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_state: Option<HealthState> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cleanup.tick() => run_cleanup(&state).await,
                _ = health.tick() => last_state = Some(refresh_health(&state, last_state).await),
            }
        }
        tracing::info!("Maintenance service stopped");
    })
}

pub async fn run_cleanup(state: &AppState) {
    match state.manager.sweep(None, false).await {
        Ok(report) if report.deleted_count > 0 || !report.errors.is_empty() => {
            tracing::info!(
                deleted = report.deleted_count,
                bytes_freed = report.bytes_freed,
                errors = report.errors.len(),
                "Retention sweep finished"
            );
        }
        Ok(_) => tracing::debug!("Retention sweep found nothing to delete"),
        Err(BackupError::SweepInProgress) => tracing::debug!("Retention sweep already running"),
        Err(e) => tracing::warn!("Retention sweep failed: {}", e),
    }

    match state.manager.sweeper().collect_orphans(state.config.orphan_grace).await {
        Ok(removed) if !removed.is_empty() => tracing::info!(
            artifacts = removed.artifacts.len(),
            descriptors = removed.descriptors.len(),
            "Removed orphaned backup files"
        ),
        Ok(_) | Err(BackupError::SweepInProgress) => {}
        Err(e) => tracing::warn!("Orphan collection failed: {}", e),
    }
}

pub async fn refresh_health(state: &AppState, previous: Option<HealthState>) -> HealthState {
    state.health.update_metrics().await;
    let report = state.health.check_health();

    if previous != Some(report.overall) {
        match report.overall {
            HealthState::Up => tracing::info!("Backup health: UP"),
            overall => tracing::warn!(issues = ?report.issues, "Backup health: {}", overall),
        }
        state.ui.broadcast(
            "health:updated",
            serde_json::to_value(&report).unwrap_or_default(),
        );
    }
    report.overall
}
