use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use backup_core::BackupError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn backup_status(err: &BackupError) -> StatusCode {
    match err {
        BackupError::NotFound(_) => StatusCode::NOT_FOUND,
        BackupError::ValidationFailed(_) | BackupError::InvalidFilename(_) => StatusCode::BAD_REQUEST,
        BackupError::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BackupError::ScheduleExists(_) | BackupError::SweepInProgress => StatusCode::CONFLICT,
        BackupError::DiskSpaceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
        BackupError::TransientIo(_) | BackupError::RetriesExhausted { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        BackupError::RestoreFailed { source, .. } => backup_status(source),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Backup(e) => backup_status(e),
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "bad_request",
            AppError::Backup(e) => e.kind(),
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // The caller must learn what state a failed restore left the database in.
        if let AppError::Backup(BackupError::RestoreFailed {
            source,
            rolled_back,
            safety_backup,
            warnings,
        }) = &self
        {
            tracing::error!("Restore failed: {self:#}");
            let body = json!({
                "error": self.to_string(),
                "kind": self.kind(),
                "cause": source.kind(),
                "rolledBack": rolled_back,
                "safetyBackup": safety_backup,
                "warnings": warnings,
            });
            return (status, Json(body)).into_response();
        }

        let msg = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {self:#}");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": msg, "kind": self.kind() }))).into_response()
    }
}
