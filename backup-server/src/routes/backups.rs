use crate::error::AppError;
use crate::models::backup_run;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_core::history::HistoryItem;
use backup_core::manager::{
    BackupOutcome, CreateRequest, RestoreOptions, RestoreOutcome, ValidationReport, CREATE_TIMEOUT,
    RESTORE_TIMEOUT,
};
use backup_core::metadata::{BackupMetadata, BackupType, SortKey};
use backup_core::retention::{RetentionPolicy, SweepReport};
use backup_core::utils::deadline::Deadline;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 1000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/history", get(get_history))
        .route("/cleanup", post(cleanup))
        .route("/{filename}", get(get_backup).delete(delete_backup))
        .route("/{filename}/restore", post(restore_backup))
        .route("/{filename}/validate", post(validate_backup))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub sort: Option<String>,
    pub limit: Option<usize>,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupMetadata>>, AppError> {
    let sort = match query.sort.as_deref() {
        Some(s) => s.parse::<SortKey>().map_err(AppError::BadRequest)?,
        None => SortKey::Date,
    };
    let limit = query.limit.filter(|l| *l > 0);
    Ok(Json(state.manager.list_backups(sort, limit).await?))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Json<BackupMetadata>, AppError> {
    Ok(Json(state.manager.get_backup(&filename).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateBackupRequest {
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: Option<BackupType>,
    pub compress: Option<bool>,
    pub validate: Option<bool>,
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateBackupRequest>>,
) -> Result<(StatusCode, Json<BackupOutcome>), AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let backup_type = body.backup_type.unwrap_or(BackupType::Manual);
    let description = body
        .description
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| format!("{} backup via API", backup_type));

    let request = CreateRequest {
        compress: body.compress,
        validate: body.validate,
        ..CreateRequest::new(description, backup_type)
    };

    let deadline = Deadline::new(&state.shutdown, CREATE_TIMEOUT);
    let outcome = state.manager.create_backup(request, deadline.token()).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<StatusCode, AppError> {
    state.manager.delete_backup(&filename).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    body: Option<Json<RestoreOptions>>,
) -> Result<Json<RestoreOutcome>, AppError> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let deadline = Deadline::new(&state.shutdown, RESTORE_TIMEOUT);
    let outcome = state
        .manager
        .restore_backup(&filename, options, deadline.token())
        .await?;
    Ok(Json(outcome))
}

async fn validate_backup(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<(StatusCode, Json<ValidationReport>), AppError> {
    let report = state.manager.validate_backup(&filename).await?;
    let status = if report.valid {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    Ok((status, Json(report)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CleanupRequest {
    pub older_than_days: Option<u64>,
    pub max_count: Option<usize>,
    pub dry_run: bool,
}

impl CleanupRequest {
    /// `None` means "use the configured policy".
    fn policy(&self) -> Result<Option<RetentionPolicy>, AppError> {
        if self.older_than_days.is_none() && self.max_count.is_none() {
            return Ok(None);
        }
        if self.older_than_days == Some(0) {
            return Err(AppError::BadRequest("olderThanDays must be at least 1".into()));
        }
        if self.max_count == Some(0) {
            return Err(AppError::BadRequest("maxCount must be at least 1".into()));
        }
        Ok(Some(RetentionPolicy {
            max_age: self.older_than_days.map(|d| Duration::from_secs(d * 86_400)),
            max_count: self.max_count,
        }))
    }
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<SweepReport>, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let report = state.manager.sweep(body.policy()?, body.dry_run).await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryItem>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let db = state.db.clone();
    let items = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup_run::find_recent(&conn, limit)
    })
    .await
    .map_err(|e| anyhow::anyhow!(e))??;
    Ok(Json(items))
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::routes::test_util::{send, send_json};
    use crate::state::test_support;
    use axum::http::StatusCode;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_list_get_validate() {
        let dir = TempDir::new().unwrap();
        let (_db, state) = test_support::state(&dir);
        let app = create_router(state);

        let (status, created) = send_json(
            &app,
            "POST",
            "/api/backups",
            json!({ "description": "nightly", "type": "automatic" }),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["backupType"], "automatic");
        assert_eq!(created["compressed"], true);
        assert_eq!(created["validated"], true);
        assert_eq!(created["checksum"].as_str().unwrap().len(), 64);
        let filename = created["filename"].as_str().unwrap().to_string();

        let (status, list) = send(&app, "GET", "/api/backups?sort=size&limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, one) = send(&app, "GET", &format!("/api/backups/{filename}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["description"], "nightly");

        let (status, report) = send(&app, "POST", &format!("/api/backups/{filename}/validate")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["valid"], true);
        assert_eq!(report["checksumMatches"], true);

        let (status, _) = send(&app, "GET", "/api/backups?sort=weight").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_restore_missing_never_spawns() {
        let dir = TempDir::new().unwrap();
        let (db, state) = test_support::state(&dir);
        let app = create_router(state);

        let (status, body) = send(&app, "POST", "/api/backups/missing.sql/restore").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
        assert_eq!(db.restore_calls(), 0);
        assert_eq!(db.dump_calls(), 0);

        let (status, body) = send(&app, "POST", "/api/backups/..%2Fetc%2Fpasswd/restore").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_filename");
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let (db, state) = test_support::state(&dir);
        let app = create_router(state);

        let (_, created) = send_json(&app, "POST", "/api/backups", json!({})).await;
        let filename = created["filename"].as_str().unwrap().to_string();

        db.set_contents("-- drifted\n");
        let (status, restored) = send_json(
            &app,
            "POST",
            &format!("/api/backups/{filename}/restore"),
            json!({ "skipSafetyBackup": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(restored["tablesAffected"], 1);
        assert_eq!(restored["recordsAffected"], 3);
        assert!(restored["safetyBackup"].is_null());
        assert_eq!(db.contents(), backup_core::testing::SAMPLE_SQL.as_bytes());
    }

    #[tokio::test]
    async fn test_failed_restore_reports_rollback() {
        let dir = TempDir::new().unwrap();
        let (db, state) = test_support::state(&dir);
        let app = create_router(state);

        let (_, created) = send_json(&app, "POST", "/api/backups", json!({})).await;
        let filename = created["filename"].as_str().unwrap().to_string();
        db.reject_next_restores(1);

        let (status, body) = send(&app, "POST", &format!("/api/backups/{filename}/restore")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "restore_failed");
        assert_eq!(body["rolledBack"], true);
        assert!(body["safetyBackup"].as_str().unwrap().starts_with("safety_backup_"));
        assert!(body["warnings"]
            .as_array()
            .unwrap()
            .iter()
            .any(|w| w == backup_core::manager::ROLLED_BACK_WARNING));
    }

    #[tokio::test]
    async fn test_cleanup_dry_run_then_delete() {
        let dir = TempDir::new().unwrap();
        let (_db, state) = test_support::state(&dir);
        let app = create_router(state);

        for _ in 0..3 {
            let (status, _) = send_json(&app, "POST", "/api/backups", json!({})).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, report) = send_json(
            &app,
            "POST",
            "/api/backups/cleanup",
            json!({ "maxCount": 1, "dryRun": true }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["candidates"].as_array().unwrap().len(), 2);
        assert_eq!(report["deletedCount"], 0);

        let (_, report) = send_json(&app, "POST", "/api/backups/cleanup", json!({ "maxCount": 1 })).await;
        assert_eq!(report["deletedCount"], 2);
        assert!(report["bytesFreed"].as_u64().unwrap() > 0);

        let (_, list) = send(&app, "GET", "/api/backups").await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, _) = send_json(&app, "POST", "/api/backups/cleanup", json!({ "maxCount": 0 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_and_history() {
        let dir = TempDir::new().unwrap();
        let (_db, state) = test_support::state(&dir);
        let app = create_router(state.clone());

        let (_, created) = send_json(&app, "POST", "/api/backups", json!({})).await;
        let filename = created["filename"].as_str().unwrap().to_string();

        let (status, _) = send(&app, "DELETE", &format!("/api/backups/{filename}")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &format!("/api/backups/{filename}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, history) = send(&app, "GET", "/api/backups/history?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert!(history.as_array().unwrap().is_empty());
    }
}
