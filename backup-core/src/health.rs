//! Health reporting over the backup directory and recent runs.
//!
//! Read-only: the monitor never deletes, retries or schedules anything.

use crate::config::HealthConfig;
use crate::history::{RunCounts, RunHistory};
use crate::metadata::{MetadataStore, SortKey};
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_age, format_bytes};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Failed runs in a row before health degrades.
const FAILURE_STREAK_WARN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Up,
    Warning,
    Down,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthState::Up => "UP",
            HealthState::Warning => "WARNING",
            HealthState::Down => "DOWN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

/// Filesystem statistics for the volume holding `path`.
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    use nix::sys::statvfs::statvfs;

    let stat = statvfs(path).map_err(|e| {
        BackupError::Io(std::io::Error::other(format!(
            "failed to get disk stats for {}: {}",
            path.display(),
            e
        )))
    })?;

    let block_size = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * block_size;
    let free = stat.blocks_free() as u64 * block_size;
    let available = stat.blocks_available() as u64 * block_size;
    let used_percent = if total == 0 {
        0.0
    } else {
        total.saturating_sub(free) as f64 / total as f64 * 100.0
    };

    Ok(DiskUsage {
        total_bytes: total,
        available_bytes: available,
        used_percent,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetrics {
    pub total_backups: usize,
    pub total_size_bytes: u64,
    pub newest_backup: Option<DateTime<Utc>>,
    pub oldest_backup: Option<DateTime<Utc>>,
    pub runs: RunCounts,
    pub consecutive_failures: usize,
    pub disk: Option<DiskUsage>,
    /// Set when the backup directory could not be read
    pub directory_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthState,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextRun {
    pub schedule_id: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub health: HealthReport,
    pub metrics: BackupMetrics,
    pub next_scheduled_run: Option<NextRun>,
}

/// Classify `metrics` against the configured thresholds.
pub fn evaluate(metrics: &BackupMetrics, config: &HealthConfig, now: DateTime<Utc>) -> HealthReport {
    let mut overall = HealthState::Up;
    let mut issues = Vec::new();
    let mut degrade = |state: HealthState, issue: String| {
        overall = overall.max(state);
        issues.push(issue);
    };

    if let Some(err) = &metrics.directory_error {
        degrade(HealthState::Down, format!("Backup directory inaccessible: {}", err));
    }

    if let Some(disk) = &metrics.disk {
        if disk.used_percent > config.disk_warn_percent {
            degrade(
                HealthState::Warning,
                format!(
                    "Disk usage {:.1}% exceeds {:.1}% ({} free)",
                    disk.used_percent,
                    config.disk_warn_percent,
                    format_bytes(disk.available_bytes)
                ),
            );
        }
    }

    if metrics.directory_error.is_none() {
        match metrics.newest_backup {
            None => degrade(HealthState::Warning, "No backups found".to_string()),
            Some(newest) => {
                let age = (now - newest).to_std().unwrap_or_default();
                if age > config.max_backup_age {
                    degrade(
                        HealthState::Warning,
                        format!("Most recent backup is {} old", format_age(age)),
                    );
                }
            }
        }
    }

    if metrics.consecutive_failures >= FAILURE_STREAK_WARN {
        degrade(
            HealthState::Warning,
            format!("Last {} backup runs failed", metrics.consecutive_failures),
        );
    }

    HealthReport {
        overall,
        issues,
        checked_at: now,
    }
}

pub struct HealthMonitor {
    store: MetadataStore,
    history: Arc<RunHistory>,
    config: HealthConfig,
    metrics: RwLock<BackupMetrics>,
}

impl HealthMonitor {
    pub fn new(store: MetadataStore, history: Arc<RunHistory>, config: HealthConfig) -> Self {
        Self {
            store,
            history,
            config,
            metrics: RwLock::new(BackupMetrics::default()),
        }
    }

    /// Refresh counters from the descriptors, run history and the filesystem.
    pub async fn update_metrics(&self) -> BackupMetrics {
        let mut metrics = BackupMetrics {
            runs: self.history.counts(),
            consecutive_failures: self.history.consecutive_failures(),
            updated_at: Some(Utc::now()),
            ..BackupMetrics::default()
        };

        match tokio::fs::metadata(self.store.dir()).await {
            Ok(meta) if meta.is_dir() => match self.store.list(SortKey::Date, None).await {
                Ok(records) => {
                    metrics.total_backups = records.len();
                    metrics.total_size_bytes = records.iter().map(|r| r.size).sum();
                    metrics.newest_backup = records.first().map(|r| r.created_at);
                    metrics.oldest_backup = records.last().map(|r| r.created_at);
                }
                Err(e) => metrics.directory_error = Some(e.to_string()),
            },
            Ok(_) => {
                metrics.directory_error = Some(format!("{} is not a directory", self.store.dir().display()))
            }
            Err(e) => metrics.directory_error = Some(format!("{}: {}", self.store.dir().display(), e)),
        }

        if metrics.directory_error.is_none() {
            let dir = self.store.dir().to_path_buf();
            metrics.disk = tokio::task::spawn_blocking(move || disk_usage(&dir))
                .await
                .ok()
                .and_then(|r| r.ok());
        }

        *self.metrics.write().unwrap_or_else(|e| e.into_inner()) = metrics.clone();
        metrics
    }

    pub fn metrics(&self) -> BackupMetrics {
        self.metrics.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Evaluate the most recently gathered metrics.
    pub fn check_health(&self) -> HealthReport {
        evaluate(&self.metrics(), &self.config, Utc::now())
    }

    pub async fn snapshot(&self, next_scheduled_run: Option<NextRun>) -> StatusSnapshot {
        let metrics = self.update_metrics().await;
        StatusSnapshot {
            health: evaluate(&metrics, &self.config, Utc::now()),
            metrics,
            next_scheduled_run,
        }
    }
}
