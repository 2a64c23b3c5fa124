use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use backup_core::health::StatusSnapshot;
use std::sync::Arc;

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.health.snapshot(state.scheduler.next_run()).await)
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::test_util::{send, send_json};
    use crate::state::test_support;
    use axum::http::StatusCode;
    use backup_core::scheduler::ScheduleEntry;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_reflects_backups_and_schedule() {
        let dir = TempDir::new().unwrap();
        let (_db, state) = test_support::state(&dir);
        let app = create_router(state.clone());

        let (status, body) = send(&app, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["health"]["overall"], "WARNING");
        assert!(body["nextScheduledRun"].is_null());

        state
            .scheduler
            .add_schedule(ScheduleEntry::new("daily", "daily 03:00".parse().unwrap()))
            .unwrap();
        send_json(&app, "POST", "/api/backups", json!({})).await;

        let (_, body) = send(&app, "GET", "/api/status").await;
        assert_eq!(body["metrics"]["totalBackups"], 1);
        assert_eq!(body["nextScheduledRun"]["scheduleId"], "daily");
        assert_eq!(body["metrics"]["runs"]["succeeded"], 1);
    }
}
