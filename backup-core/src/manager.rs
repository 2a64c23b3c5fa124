//! The backup pipeline: dump → compress → checksum → place → record, and the
//! guarded restore path.
//!
//! One `BackupManager` is built by each entry point and shared by reference;
//! there is no process-wide instance.

use crate::artifact::{self, TempFiles};
use crate::checksum;
use crate::config::{BackupSettings, Config};
use crate::events::{BackupEvent, EventBus};
use crate::executor::{Dumper, PgExecutor, RestoreStats, Restorer};
use crate::health;
use crate::history::{HistoryItem, RunHistory};
use crate::metadata::{BackupMetadata, BackupType, MetadataStore, SortKey};
use crate::retention::{RetentionPolicy, SweepReport, Sweeper};
use crate::retry::RetryPolicy;
use crate::utils::deadline::Deadline;
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Overall bound a caller puts on one create, retries included.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Warning attached to a failed restore whose safety backup was put back.
pub const ROLLED_BACK_WARNING: &str = "Restored from safety backup due to main restore failure";

/// Overall bound a caller puts on one restore, safety backup included.
pub const RESTORE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Default)]
pub struct CreateRequest {
    pub description: String,
    pub backup_type: BackupType,
    /// Falls back to `backup.compress`
    pub compress: Option<bool>,
    /// Falls back to `backup.validate_after_backup`
    pub validate: Option<bool>,
    pub schedule_id: Option<String>,
}

impl CreateRequest {
    pub fn new(description: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            description: description.into(),
            backup_type,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupOutcome {
    #[serde(flatten)]
    pub metadata: BackupMetadata,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreOptions {
    pub skip_safety_backup: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreOutcome {
    pub filename: String,
    pub tables_affected: u64,
    pub records_affected: u64,
    pub warnings: Vec<String>,
    pub safety_backup: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub filename: String,
    pub size: u64,
    pub checksum: String,
    pub expected_checksum: Option<String>,
    /// `None` when the artifact has no descriptor to compare against
    pub checksum_matches: Option<bool>,
    pub content_valid: bool,
    pub issues: Vec<String>,
    pub valid: bool,
}

pub struct BackupManager {
    settings: BackupSettings,
    database_name: String,
    retention: RetentionPolicy,
    dumper: Arc<dyn Dumper>,
    restorer: Arc<dyn Restorer>,
    store: MetadataStore,
    sweeper: Sweeper,
    retry: RetryPolicy,
    history: Arc<RunHistory>,
    events: EventBus,
}

impl BackupManager {
    pub fn new(config: &Config, dumper: Arc<dyn Dumper>, restorer: Arc<dyn Restorer>) -> Self {
        let store = MetadataStore::new(&config.backup.dir);
        Self {
            settings: config.backup.clone(),
            database_name: config.database.name.clone(),
            retention: config.retention_policy(),
            dumper,
            restorer,
            sweeper: Sweeper::new(store.clone()),
            store,
            retry: RetryPolicy::new(config.backup.max_retries, config.backup.retry_wait),
            history: Arc::new(RunHistory::default()),
            events: EventBus::new(),
        }
    }

    /// Manager backed by `pg_dump` and `psql`.
    pub fn from_config(config: &Config) -> Self {
        let executor = Arc::new(PgExecutor::new(&config.database, config.backup.stop_grace));
        Self::new(config, executor.clone(), executor)
    }

    pub async fn init(&self) -> Result<()> {
        self.store.ensure_dir().await?;
        info!(dir = %self.store.dir().display(), "Backup directory ready");
        Ok(())
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub fn history(&self) -> Arc<RunHistory> {
        Arc::clone(&self.history)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.retention
    }

    pub async fn list_backups(&self, sort: SortKey, limit: Option<usize>) -> Result<Vec<BackupMetadata>> {
        self.store.list(sort, limit).await
    }

    pub async fn get_backup(&self, filename: &str) -> Result<BackupMetadata> {
        self.store.get(filename).await
    }

    pub async fn create_backup(
        &self,
        request: CreateRequest,
        cancel: &CancellationToken,
    ) -> Result<BackupOutcome> {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!(
            run_id = %run_id,
            backup_type = %request.backup_type,
            schedule_id = ?request.schedule_id,
            "Starting backup"
        );
        self.events.publish(BackupEvent::BackupStarted {
            run_id: run_id.clone(),
            backup_type: request.backup_type,
            schedule_id: request.schedule_id.clone(),
            description: request.description.clone(),
        });

        let result = self.run_create(&request, cancel, started).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => {
                info!(
                    run_id = %run_id,
                    filename = %outcome.metadata.filename,
                    size = outcome.metadata.size,
                    duration_ms,
                    "Backup completed"
                );
                self.history.push(HistoryItem {
                    timestamp: Utc::now(),
                    schedule_id: request.schedule_id.clone(),
                    backup_type: request.backup_type,
                    filename: Some(outcome.metadata.filename.clone()),
                    success: true,
                    duration_ms,
                    size: outcome.metadata.size,
                    error: None,
                    metadata: Some(outcome.metadata.clone()),
                });
                self.events.publish(BackupEvent::BackupCompleted {
                    run_id,
                    schedule_id: request.schedule_id.clone(),
                    duration_ms,
                    metadata: outcome.metadata.clone(),
                });
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, kind = e.kind(), "Backup failed");
                self.history.push(HistoryItem {
                    timestamp: Utc::now(),
                    schedule_id: request.schedule_id.clone(),
                    backup_type: request.backup_type,
                    filename: None,
                    success: false,
                    duration_ms,
                    size: 0,
                    error: Some(e.to_string()),
                    metadata: None,
                });
                self.events.publish(BackupEvent::BackupFailed {
                    run_id,
                    schedule_id: request.schedule_id.clone(),
                    backup_type: request.backup_type,
                    duration_ms,
                    error: e.to_string(),
                    kind: e.kind().to_string(),
                });
            }
        }

        result
    }

    async fn run_create(
        &self,
        request: &CreateRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<BackupOutcome> {
        self.store.ensure_dir().await?;
        self.check_free_space()?;

        let compress = request.compress.unwrap_or(self.settings.compress);
        let validate = request.validate.unwrap_or(self.settings.validate_after_backup);
        let codec = compress.then_some(self.settings.compression);

        let filename = artifact::generate_filename(request.backup_type, Utc::now(), codec);
        let final_path = self.store.artifact_path(&filename);
        let mut temps = TempFiles::new();
        let raw = temps.track(self.store.dir().join(format!(".{}.dump.tmp", filename)));

        let deadline = Deadline::new(cancel, self.settings.timeout);
        let dumped = self
            .retry
            .execute("dump", deadline.token(), |_attempt| {
                let dumper = &self.dumper;
                let raw = raw.as_path();
                let token = deadline.token();
                async move { dumper.create_dump(raw, token).await }
            })
            .await
            .map_err(|e| explain_cancel(e, &deadline))?;

        let mut warnings: Vec<String> = dumped
            .failures
            .iter()
            .map(|f| format!("dump attempt {} failed: {}", f.attempt, f.error))
            .collect();

        let raw_size = tokio::fs::metadata(&raw).await?.len();
        if raw_size == 0 {
            return Err(BackupError::ValidationFailed("dump produced no output".into()));
        }
        artifact::sync_file(&raw).await?;

        let staged = match codec {
            Some(codec) => {
                let packed = temps.track(artifact::temp_path_for(&final_path));
                artifact::compress(&raw, &packed, codec, self.settings.compression_level).await?;
                packed
            }
            None => raw.clone(),
        };

        if validate {
            artifact::check_sql_content(&staged).await?;
        }

        let checksum = checksum::compute_checksum(&staged).await?;
        let size = tokio::fs::metadata(&staged).await?.len();
        if codec.is_none() && size != dumped.value.bytes_written && dumped.value.bytes_written > 0 {
            warnings.push(format!(
                "dump reported {} bytes but {} are on disk",
                dumped.value.bytes_written, size
            ));
        }

        artifact::finalize(&staged, &final_path).await?;

        let metadata = BackupMetadata {
            filename: filename.clone(),
            size,
            created_at: Utc::now(),
            description: request.description.clone(),
            backup_type: request.backup_type,
            compressed: codec.is_some(),
            encrypted: false,
            validated: validate,
            checksum: checksum.clone(),
            database_name: self.database_name.clone(),
            warnings,
        };

        let recorded = async {
            if validate {
                checksum::ensure_checksum(&final_path, &checksum).await?;
            }
            self.store.record(&metadata).await
        }
        .await;

        if let Err(e) = recorded {
            // Never leave an artifact without a descriptor behind.
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(e);
        }

        Ok(BackupOutcome {
            metadata,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: dumped.attempts,
        })
    }

    fn check_free_space(&self) -> Result<()> {
        let required = self.settings.min_free_bytes;
        if required == 0 {
            return Ok(());
        }
        let usage = health::disk_usage(self.store.dir())?;
        if usage.available_bytes < required {
            return Err(BackupError::DiskSpaceExhausted {
                available: usage.available_bytes,
                required,
            });
        }
        Ok(())
    }

    /// Restore `filename` into the database.
    ///
    /// Unknown or unsafe names fail before anything is spawned. A checksum
    /// mismatch aborts. Unless suppressed, a safety backup is taken first and
    /// restored again if the main restore fails.
    pub async fn restore_backup(
        &self,
        filename: &str,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> Result<RestoreOutcome> {
        artifact::validate_filename(filename)?;
        let path = self.store.artifact_path(filename);
        if !tokio::fs::try_exists(&path).await? {
            return Err(BackupError::NotFound(filename.to_string()));
        }

        let started = Instant::now();
        info!(filename, "Starting restore");
        self.events.publish(BackupEvent::RestoreStarted {
            filename: filename.to_string(),
        });

        let result = self.run_restore(filename, &path, &options, cancel, started).await;

        match &result {
            Ok(outcome) => {
                info!(
                    filename,
                    tables = outcome.tables_affected,
                    records = outcome.records_affected,
                    duration_ms = outcome.duration_ms,
                    "Restore completed"
                );
                self.events.publish(BackupEvent::RestoreCompleted {
                    filename: filename.to_string(),
                    duration_ms: outcome.duration_ms,
                    stats: RestoreStats {
                        tables_affected: outcome.tables_affected,
                        records_affected: outcome.records_affected,
                        warnings: outcome.warnings.clone(),
                    },
                });
            }
            Err(e) => {
                let rolled_back = matches!(e, BackupError::RestoreFailed { rolled_back: true, .. });
                error!(filename, error = %e, rolled_back, "Restore failed");
                self.events.publish(BackupEvent::RestoreFailed {
                    filename: filename.to_string(),
                    error: e.to_string(),
                    kind: e.kind().to_string(),
                    rolled_back,
                });
            }
        }
        result
    }

    async fn run_restore(
        &self,
        filename: &str,
        path: &Path,
        options: &RestoreOptions,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RestoreOutcome> {
        let mut warnings = Vec::new();

        match self.store.get(filename).await {
            Ok(descriptor) => checksum::ensure_checksum(path, &descriptor.checksum).await?,
            Err(BackupError::NotFound(_)) => {
                warn!(filename, "No descriptor for artifact, restoring without checksum verification");
                warnings.push("no descriptor found, checksum not verified".to_string());
            }
            Err(e) => return Err(e),
        }

        if self.settings.validate_before_restore {
            artifact::check_sql_content(path).await?;
        }

        let safety_backup = if self.settings.safety_backup_before_restore && !options.skip_safety_backup {
            let request = CreateRequest {
                validate: Some(true),
                ..CreateRequest::new(format!("Safety backup before restoring {}", filename), BackupType::Safety)
            };
            let outcome = self.create_backup(request, cancel).await?;
            info!(filename, safety_backup = %outcome.metadata.filename, "Safety backup taken");
            Some(outcome.metadata.filename)
        } else {
            None
        };

        let mut temps = TempFiles::new();
        let restored = match self.restore_artifact(path, cancel, &mut temps).await {
            Ok(restored) => restored,
            Err(e) => {
                let Some(safety) = safety_backup else {
                    return Err(e);
                };
                let rolled_back = match self.roll_back(&safety).await {
                    Ok(()) => {
                        warn!(filename, safety_backup = %safety, "Rolled back to safety backup");
                        warnings.push(ROLLED_BACK_WARNING.to_string());
                        true
                    }
                    Err(rollback_err) => {
                        error!(filename, safety_backup = %safety, error = %rollback_err, "Rollback failed");
                        warnings.push(format!(
                            "Rollback to safety backup {} failed: {}",
                            safety, rollback_err
                        ));
                        false
                    }
                };
                return Err(BackupError::RestoreFailed {
                    source: Box::new(e),
                    rolled_back,
                    safety_backup: safety,
                    warnings,
                });
            }
        };

        let (stats, attempts, failures) = restored;
        warnings.extend(failures);
        warnings.extend(stats.warnings);

        Ok(RestoreOutcome {
            filename: filename.to_string(),
            tables_affected: stats.tables_affected,
            records_affected: stats.records_affected,
            warnings,
            safety_backup,
            duration_ms: started.elapsed().as_millis() as u64,
            attempts,
        })
    }

    /// Decode if needed, then restore under the retry policy and deadline.
    async fn restore_artifact(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        temps: &mut TempFiles,
    ) -> Result<(RestoreStats, u32, Vec<String>)> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let input = if artifact::codec_of(&name).is_some() {
            let plain = temps.track(self.store.dir().join(format!(".{}.restore.tmp", name)));
            artifact::decompress_to(path, &plain).await?;
            plain
        } else {
            path.to_path_buf()
        };

        let deadline = Deadline::new(cancel, self.settings.timeout);
        let restored = self
            .retry
            .execute("restore", deadline.token(), |_attempt| {
                let restorer = &self.restorer;
                let input = input.as_path();
                let token = deadline.token();
                async move { restorer.restore_dump(input, token).await }
            })
            .await
            .map_err(|e| explain_cancel(e, &deadline))?;

        let failures = restored
            .failures
            .iter()
            .map(|f| format!("restore attempt {} failed: {}", f.attempt, f.error))
            .collect();
        Ok((restored.value, restored.attempts, failures))
    }

    /// Put the safety backup back. Runs under its own deadline so a cancelled
    /// caller still gets the database returned to its previous state.
    async fn roll_back(&self, safety_backup: &str) -> Result<()> {
        let path = self.store.artifact_path(safety_backup);
        let mut temps = TempFiles::new();
        self.restore_artifact(&path, &CancellationToken::new(), &mut temps)
            .await
            .map(|_| ())
    }

    /// Checksum and content check of a stored artifact.
    pub async fn validate_backup(&self, filename: &str) -> Result<ValidationReport> {
        artifact::validate_filename(filename)?;
        let path = self.store.artifact_path(filename);
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| BackupError::from_io(e, filename))?
            .len();

        let descriptor = match self.store.get(filename).await {
            Ok(descriptor) => Some(descriptor),
            Err(BackupError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let mut issues = Vec::new();
        let checksum = checksum::compute_checksum(&path).await?;
        let checksum_matches = descriptor
            .as_ref()
            .map(|d| d.checksum.eq_ignore_ascii_case(&checksum));
        match (&descriptor, checksum_matches) {
            (Some(d), Some(false)) => issues.push(format!(
                "checksum mismatch: expected {}, found {}",
                d.checksum, checksum
            )),
            (None, _) => issues.push("no descriptor recorded for this artifact".to_string()),
            _ => {}
        }

        let content_valid = match artifact::check_sql_content(&path).await {
            Ok(()) => true,
            Err(BackupError::ValidationFailed(msg)) => {
                issues.push(msg);
                false
            }
            Err(e) => return Err(e),
        };

        let valid = content_valid && checksum_matches != Some(false);
        if valid && descriptor.as_ref().map(|d| !d.validated).unwrap_or(false) {
            self.store.mark_validated(filename).await?;
        }

        Ok(ValidationReport {
            filename: filename.to_string(),
            size,
            checksum,
            expected_checksum: descriptor.map(|d| d.checksum),
            checksum_matches,
            content_valid,
            issues,
            valid,
        })
    }

    /// Delete one backup: artifact first, then its descriptor.
    pub async fn delete_backup(&self, filename: &str) -> Result<()> {
        artifact::validate_filename(filename)?;
        let file_removed = match tokio::fs::remove_file(self.store.artifact_path(filename)).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match self.store.delete(filename).await {
            Ok(()) => {}
            Err(BackupError::NotFound(_)) if file_removed => {}
            Err(e) => return Err(e),
        }
        info!(filename, "Backup deleted");
        Ok(())
    }

    /// Run a retention sweep with `policy`, or the configured one.
    pub async fn sweep(&self, policy: Option<RetentionPolicy>, dry_run: bool) -> Result<SweepReport> {
        let policy = policy.unwrap_or(self.retention);
        let report = self.sweeper.sweep(&policy, dry_run).await?;
        self.events.publish(BackupEvent::SweepCompleted(report.clone()));
        Ok(report)
    }
}

fn explain_cancel(err: BackupError, deadline: &Deadline) -> BackupError {
    match err {
        BackupError::Cancelled(_) => BackupError::Cancelled(deadline.cancel_reason()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionCodec;
    use crate::testing::{FakeDatabase, SAMPLE_SQL};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<FakeDatabase>, BackupManager) {
        let mut config = Config::default();
        config.backup.dir = dir.path().to_path_buf();
        config.backup.retry_wait = Duration::from_millis(5);
        config.backup.max_retries = 3;
        let db = Arc::new(FakeDatabase::default());
        let manager = BackupManager::new(&config, db.clone(), db.clone());
        (db, manager)
    }

    fn manual(description: &str) -> CreateRequest {
        CreateRequest::new(description, BackupType::Manual)
    }

    fn is_hex64(s: &str) -> bool {
        s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
    }

    #[tokio::test]
    async fn test_create_compressed_and_validated() {
        let dir = TempDir::new().unwrap();
        let (_db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let request = CreateRequest {
            compress: Some(true),
            validate: Some(true),
            ..CreateRequest::new("nightly", BackupType::Automatic)
        };
        let outcome = manager.create_backup(request, &cancel).await.unwrap();
        let meta = &outcome.metadata;

        assert!(meta.compressed);
        assert!(meta.validated);
        assert!(meta.size > 0);
        assert!(is_hex64(&meta.checksum));
        assert!(meta.filename.starts_with("automatic_backup_"));
        assert!(meta.filename.ends_with(".sql.gz"));

        let path = manager.store().artifact_path(&meta.filename);
        assert!(checksum::verify(&path, &meta.checksum).await.unwrap());
        assert_eq!(manager.get_backup(&meta.filename).await.unwrap(), *meta);

        // Only the artifact and its descriptor remain.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        assert_eq!(manager.history().counts().succeeded, 1);
    }

    #[tokio::test]
    async fn test_create_uncompressed_zstd_setting_ignored() {
        let dir = TempDir::new().unwrap();
        let (db, mut manager) = setup(&dir);
        manager.settings.compression = CompressionCodec::Zstd;
        let cancel = CancellationToken::new();

        let request = CreateRequest {
            compress: Some(false),
            ..manual("plain")
        };
        let outcome = manager.create_backup(request, &cancel).await.unwrap();
        assert!(outcome.metadata.filename.ends_with(".sql"));

        let on_disk = std::fs::read(manager.store().artifact_path(&outcome.metadata.filename)).unwrap();
        assert_eq!(on_disk, db.contents());
    }

    #[tokio::test]
    async fn test_create_retries_transient_failures() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        db.fail_next_dumps(2);

        let outcome = manager
            .create_backup(manual("flaky"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(db.dump_calls(), 3);
        assert_eq!(outcome.metadata.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        db.fail_next_dumps(10);

        let err = manager
            .create_backup(manual("down"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(db.dump_calls(), 3);
        assert!(manager.list_backups(SortKey::Date, None).await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(manager.history().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_empty_dump_rejected() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        db.set_contents(Vec::new());

        let err = manager
            .create_backup(manual("empty"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ValidationFailed(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_dump_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (db, mut manager) = setup(&dir);
        manager.settings.timeout = Duration::from_millis(50);
        db.set_delay(Duration::from_secs(30));

        let err = manager
            .create_backup(manual("slow"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            BackupError::Cancelled(reason) => assert!(reason.contains("deadline")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_creates_produce_independent_records() {
        let dir = TempDir::new().unwrap();
        let (_db, manager) = setup(&dir);
        let manager = Arc::new(manager);
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            manager.create_backup(CreateRequest { schedule_id: Some("a".into()), ..manual("a") }, &cancel),
            manager.create_backup(CreateRequest { schedule_id: Some("b".into()), ..manual("b") }, &cancel),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.metadata.filename, b.metadata.filename);

        let records = manager.list_backups(SortKey::Name, None).await.unwrap();
        assert_eq!(records.len(), 2);
        for record in records {
            let path = manager.store().artifact_path(&record.filename);
            assert!(checksum::verify(&path, &record.checksum).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_restore_missing_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);

        let err = manager
            .restore_backup("missing.sql", RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::NotFound(_)));
        assert_eq!(db.dump_calls(), 0);
        assert_eq!(db.restore_calls(), 0);

        let err = manager
            .restore_backup("../../etc/passwd", RestoreOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::InvalidFilename(_)));
    }

    #[tokio::test]
    async fn test_restore_round_trip_with_safety_backup() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let original = manager.create_backup(manual("before"), &cancel).await.unwrap();
        db.set_contents("SET x = 1;\nCREATE TABLE other (id int);\n");

        let outcome = manager
            .restore_backup(&original.metadata.filename, RestoreOptions::default(), &cancel)
            .await
            .unwrap();

        assert_eq!(db.contents(), SAMPLE_SQL.as_bytes());
        assert_eq!(outcome.tables_affected, 1);
        assert_eq!(outcome.records_affected, 3);

        let safety = outcome.safety_backup.expect("safety backup taken");
        let safety_meta = manager.get_backup(&safety).await.unwrap();
        assert_eq!(safety_meta.backup_type, BackupType::Safety);

        // Restoring twice yields identical dumps.
        manager
            .restore_backup(
                &original.metadata.filename,
                RestoreOptions { skip_safety_backup: true },
                &cancel,
            )
            .await
            .unwrap();
        let first = manager
            .create_backup(CreateRequest { compress: Some(false), ..manual("check") }, &cancel)
            .await
            .unwrap();
        manager
            .restore_backup(
                &original.metadata.filename,
                RestoreOptions { skip_safety_backup: true },
                &cancel,
            )
            .await
            .unwrap();
        let second = manager
            .create_backup(CreateRequest { compress: Some(false), ..manual("check") }, &cancel)
            .await
            .unwrap();
        assert_eq!(first.metadata.checksum, second.metadata.checksum);
    }

    #[tokio::test]
    async fn test_restore_refuses_tampered_artifact() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let created = manager
            .create_backup(CreateRequest { compress: Some(false), ..manual("t") }, &cancel)
            .await
            .unwrap();
        let path = manager.store().artifact_path(&created.metadata.filename);
        std::fs::write(&path, "SET x = 1;\nDROP TABLE words;\n").unwrap();

        let err = manager
            .restore_backup(&created.metadata.filename, RestoreOptions::default(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
        assert_eq!(db.restore_calls(), 0);
        assert_eq!(db.dump_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_restore_rolls_back_to_safety_backup() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        let cancel = CancellationToken::new();
        let mut events = manager.events().subscribe();

        let created = manager.create_backup(manual("base"), &cancel).await.unwrap();
        let current = "SET y = 2;\nCREATE TABLE current (id int);\n";
        db.set_contents(current);
        db.reject_next_restores(1);

        let err = manager
            .restore_backup(&created.metadata.filename, RestoreOptions::default(), &cancel)
            .await
            .unwrap_err();

        match err {
            BackupError::RestoreFailed {
                source,
                rolled_back,
                safety_backup,
                warnings,
            } => {
                assert!(matches!(*source, BackupError::ToolFailed { .. }));
                assert!(rolled_back);
                assert!(safety_backup.starts_with("safety_backup_"));
                assert!(warnings.iter().any(|w| w == ROLLED_BACK_WARNING));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(db.restore_calls(), 2);
        assert_eq!(db.contents(), current.as_bytes());

        let mut rolled_back = None;
        while let Ok(event) = events.try_recv() {
            if let BackupEvent::RestoreFailed { rolled_back: rb, .. } = event {
                rolled_back = Some(rb);
            }
        }
        assert_eq!(rolled_back, Some(true));
    }

    #[tokio::test]
    async fn test_failed_restore_without_safety_backup_is_plain_error() {
        let dir = TempDir::new().unwrap();
        let (db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let created = manager.create_backup(manual("base"), &cancel).await.unwrap();
        db.reject_next_restores(1);

        let err = manager
            .restore_backup(
                &created.metadata.filename,
                RestoreOptions { skip_safety_backup: true },
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ToolFailed { .. }));
        assert_eq!(db.restore_calls(), 1);
    }

    #[tokio::test]
    async fn test_default_config_create_is_compressed_and_validated() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.backup.dir = dir.path().to_path_buf();
        let db = Arc::new(FakeDatabase::default());
        let manager = BackupManager::new(&config, db.clone(), db);

        let outcome = manager
            .create_backup(
                CreateRequest::new("nightly", BackupType::Automatic),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.metadata.compressed);
        assert!(outcome.metadata.validated);
        assert!(outcome.metadata.filename.ends_with(&format!(".sql.{}", config.backup.compression.extension())));
        let report = manager.validate_backup(&outcome.metadata.filename).await.unwrap();
        assert!(report.valid);
    }

    #[tokio::test]
    async fn test_validate_reports_mismatch_and_marks_valid() {
        let dir = TempDir::new().unwrap();
        let (_db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let created = manager
            .create_backup(
                CreateRequest {
                    compress: Some(false),
                    validate: Some(false),
                    ..manual("v")
                },
                &cancel,
            )
            .await
            .unwrap();
        assert!(!created.metadata.validated);

        let report = manager.validate_backup(&created.metadata.filename).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.checksum_matches, Some(true));
        assert!(manager.get_backup(&created.metadata.filename).await.unwrap().validated);

        let path = manager.store().artifact_path(&created.metadata.filename);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.push(0);
        std::fs::write(&path, bytes).unwrap();

        let report = manager.validate_backup(&created.metadata.filename).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.checksum_matches, Some(false));

        assert!(matches!(
            manager.validate_backup("nope.sql").await,
            Err(BackupError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_artifact_and_descriptor() {
        let dir = TempDir::new().unwrap();
        let (_db, manager) = setup(&dir);
        let cancel = CancellationToken::new();

        let created = manager.create_backup(manual("d"), &cancel).await.unwrap();
        let filename = created.metadata.filename;

        manager.delete_backup(&filename).await.unwrap();
        assert!(!manager.store().artifact_path(&filename).exists());
        assert!(matches!(manager.get_backup(&filename).await, Err(BackupError::NotFound(_))));

        assert!(matches!(manager.delete_backup(&filename).await, Err(BackupError::NotFound(_))));
        assert!(matches!(
            manager.delete_backup("../etc/passwd").await,
            Err(BackupError::InvalidFilename(_))
        ));
    }

    #[tokio::test]
    async fn test_disk_space_precheck() {
        let dir = TempDir::new().unwrap();
        let (db, mut manager) = setup(&dir);
        manager.settings.min_free_bytes = u64::MAX;

        let err = manager
            .create_backup(manual("full"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::DiskSpaceExhausted { .. }));
        assert_eq!(db.dump_calls(), 0);
    }
}
