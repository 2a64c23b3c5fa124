use crate::error::AppError;
use crate::models::schedule;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use backup_core::scheduler::{ScheduleEntry, ScheduleStatus};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_schedules).post(add_schedule))
        .route("/{id}", patch(update_schedule).get(get_schedule).delete(remove_schedule))
        .route("/{id}/run", post(run_schedule))
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> Json<Vec<ScheduleStatus>> {
    Json(state.scheduler.entries())
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScheduleStatus>, AppError> {
    Ok(Json(state.scheduler.get(&id)?))
}

async fn add_schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleEntry>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let id = state.scheduler.add_schedule(body)?;
    let entry = state.scheduler.get(&id)?.entry;

    let db = state.db.clone();
    let stored = entry.clone();
    let persisted = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        schedule::insert(&conn, &stored)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    if let Err(e) = persisted {
        // Keep the scheduler and the table in step
        if let Err(revert) = state.scheduler.remove_schedule(&id) {
            tracing::error!(schedule_id = %id, "Failed to drop unsaved schedule: {}", revert);
        }
        return Err(e.into());
    }

    state.ui.broadcast("schedule:added", serde_json::to_value(&entry).unwrap_or_default());
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

#[derive(Deserialize)]
pub struct UpdateScheduleRequest {
    pub enabled: bool,
}

async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Result<Json<ScheduleStatus>, AppError> {
    let previous = state.scheduler.get(&id)?.entry.enabled;
    state.scheduler.set_enabled(&id, body.enabled)?;

    let db = state.db.clone();
    let id2 = id.clone();
    let persisted = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        schedule::set_enabled(&conn, &id2, body.enabled)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))?;

    if let Err(e) = persisted {
        if let Err(revert) = state.scheduler.set_enabled(&id, previous) {
            tracing::error!(schedule_id = %id, "Failed to revert schedule state: {}", revert);
        }
        return Err(e.into());
    }

    let status = state.scheduler.get(&id)?;
    state.ui.broadcast(
        "schedule:updated",
        serde_json::json!({ "id": id, "enabled": status.entry.enabled }),
    );
    Ok(Json(status))
}

async fn remove_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.scheduler.remove_schedule(&id)?;

    let db = state.db.clone();
    let id2 = id.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        schedule::delete(&conn, &id2)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;

    state.ui.broadcast("schedule:removed", serde_json::json!({ "id": id }));
    Ok(StatusCode::NO_CONTENT)
}

async fn run_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    state.scheduler.trigger(&id)?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "triggered": true }))))
}
