//! Error taxonomy for backup operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Process spawn failures, refused connections and timeouts. Retryable.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    #[error("Checksum mismatch for {filename}: expected {expected}, found {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Disk space exhausted: {available} bytes free, {required} bytes required")]
    DiskSpaceExhausted { available: u64, required: u64 },

    #[error("{source} (gave up after {attempts} attempts)")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<BackupError>,
    },

    /// The main restore failed after a safety backup was taken.
    #[error("{source} ({})", rollback_note(.rolled_back, .safety_backup))]
    RestoreFailed {
        #[source]
        source: Box<BackupError>,
        rolled_back: bool,
        safety_backup: String,
        warnings: Vec<String>,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid backup filename: {0}")]
    InvalidFilename(String),

    #[error("Schedule already exists: {0}")]
    ScheduleExists(String),

    #[error("A retention sweep is already running")]
    SweepInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Whether the retry policy may run the operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::TransientIo(_))
    }

    /// Stable tag used in API error bodies and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::TransientIo(_) => "transient_io",
            BackupError::ChecksumMismatch { .. } => "checksum_mismatch",
            BackupError::NotFound(_) => "not_found",
            BackupError::ValidationFailed(_) => "validation_failed",
            BackupError::DiskSpaceExhausted { .. } => "disk_space_exhausted",
            BackupError::RetriesExhausted { .. } => "retries_exhausted",
            BackupError::RestoreFailed { .. } => "restore_failed",
            BackupError::ToolFailed { .. } => "tool_failed",
            BackupError::Cancelled(_) => "cancelled",
            BackupError::InvalidFilename(_) => "invalid_filename",
            BackupError::ScheduleExists(_) => "schedule_exists",
            BackupError::SweepInProgress => "sweep_in_progress",
            BackupError::Config(_) => "config",
            BackupError::Io(_) => "io",
            BackupError::Serialization(_) => "serialization",
        }
    }

    /// Maps a missing-file I/O error onto `NotFound`, everything else onto `Io`.
    pub fn from_io(err: std::io::Error, what: impl std::fmt::Display) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            BackupError::NotFound(what.to_string())
        } else {
            BackupError::Io(err)
        }
    }
}

fn rollback_note(rolled_back: &bool, safety_backup: &str) -> String {
    if *rolled_back {
        format!("database rolled back to safety backup {}", safety_backup)
    } else {
        format!("rollback to safety backup {} failed", safety_backup)
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_io_is_retryable() {
        assert!(BackupError::TransientIo("connection refused".into()).is_transient());
        assert!(!BackupError::ChecksumMismatch {
            filename: "a.sql".into(),
            expected: "00".into(),
            actual: "11".into(),
        }
        .is_transient());
        assert!(!BackupError::Cancelled("deadline".into()).is_transient());
        assert!(!BackupError::NotFound("a.sql".into()).is_transient());
    }

    #[test]
    fn test_retries_exhausted_message_carries_attempts() {
        let err = BackupError::RetriesExhausted {
            attempts: 3,
            source: Box::new(BackupError::TransientIo("connection refused".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("3 attempts"));
        assert_eq!(err.kind(), "retries_exhausted");
    }

    #[test]
    fn test_restore_failure_names_rollback_outcome() {
        let err = BackupError::RestoreFailed {
            source: Box::new(BackupError::ToolFailed {
                tool: "psql".into(),
                status: "exit code 3".into(),
                stderr: "relation exists".into(),
            }),
            rolled_back: true,
            safety_backup: "safety_backup_x.sql.gz".into(),
            warnings: Vec::new(),
        };
        assert!(err.to_string().contains("relation exists"));
        assert!(err.to_string().contains("rolled back to safety backup safety_backup_x.sql.gz"));
        assert_eq!(err.kind(), "restore_failed");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_from_io_maps_not_found() {
        let err = BackupError::from_io(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "missing.sql",
        );
        assert!(matches!(err, BackupError::NotFound(ref f) if f == "missing.sql"));

        let err = BackupError::from_io(
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"),
            "locked.sql",
        );
        assert_eq!(err.kind(), "io");
    }
}
