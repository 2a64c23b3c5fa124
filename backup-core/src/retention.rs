//! Retention sweeps: Idle → Scanning → Pruning → Idle.
//!
//! When both limits are configured a record is pruned if it violates either
//! one. Each prune deletes the artifact before its descriptor.

use crate::metadata::{BackupMetadata, MetadataStore, SortKey};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(with = "humantime_serde", default)]
    pub max_age: Option<Duration>,
    #[serde(default)]
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_age.is_none() && self.max_count.is_none()
    }
}

/// Records the policy would prune, newest first.
///
/// A record is selected when it is older than `max_age` or falls outside the
/// newest `max_count` records.
pub fn plan(records: &[BackupMetadata], policy: &RetentionPolicy, now: DateTime<Utc>) -> Vec<BackupMetadata> {
    let mut ordered = records.to_vec();
    crate::metadata::sort_records(&mut ordered, SortKey::Date);

    let cutoff = policy
        .max_age
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .map(|age| now - age);

    ordered
        .into_iter()
        .enumerate()
        .filter(|(rank, record)| {
            let too_old = cutoff.map(|c| record.created_at < c).unwrap_or(false);
            let over_count = policy.max_count.map(|n| *rank >= n).unwrap_or(false);
            too_old || over_count
        })
        .map(|(_, record)| record)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepPhase {
    Idle,
    Scanning,
    Pruning,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepCandidate {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub dry_run: bool,
    pub candidates: Vec<SweepCandidate>,
    pub deleted_count: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

/// Artifacts without descriptors and descriptors without artifacts.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Orphans {
    pub artifacts: Vec<String>,
    pub descriptors: Vec<String>,
}

impl Orphans {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.descriptors.is_empty()
    }
}

/// Runs one sweep at a time over a backup directory.
#[derive(Debug, Clone)]
pub struct Sweeper {
    store: MetadataStore,
    phase: Arc<Mutex<SweepPhase>>,
    running: Arc<tokio::sync::Mutex<()>>,
}

struct PhaseReset<'a>(&'a Mutex<SweepPhase>);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = SweepPhase::Idle;
    }
}

impl Sweeper {
    pub fn new(store: MetadataStore) -> Self {
        Self {
            store,
            phase: Arc::new(Mutex::new(SweepPhase::Idle)),
            running: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn phase(&self) -> SweepPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, phase: SweepPhase) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    /// Scan and, unless `dry_run`, prune. Fails fast with `SweepInProgress`.
    pub async fn sweep(&self, policy: &RetentionPolicy, dry_run: bool) -> Result<SweepReport> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| BackupError::SweepInProgress)?;
        let _reset = PhaseReset(&self.phase);

        self.enter(SweepPhase::Scanning);
        let records = self.store.list(SortKey::Date, None).await?;
        let marked = plan(&records, policy, Utc::now());

        let mut report = SweepReport {
            dry_run,
            candidates: marked
                .iter()
                .map(|r| SweepCandidate {
                    filename: r.filename.clone(),
                    size: r.size,
                    created_at: r.created_at,
                })
                .collect(),
            deleted_count: 0,
            bytes_freed: 0,
            errors: Vec::new(),
        };

        if dry_run {
            info!(candidates = report.candidates.len(), "Retention dry run complete");
            return Ok(report);
        }

        self.enter(SweepPhase::Pruning);
        for record in &marked {
            match self.prune(record).await {
                Ok(()) => {
                    report.deleted_count += 1;
                    report.bytes_freed += record.size;
                }
                Err(e) => {
                    warn!(filename = %record.filename, error = %e, "Failed to prune backup");
                    report.errors.push(format!("{}: {}", record.filename, e));
                }
            }
        }

        info!(
            deleted = report.deleted_count,
            bytes_freed = report.bytes_freed,
            errors = report.errors.len(),
            "Retention sweep complete"
        );
        Ok(report)
    }

    /// Artifact first, then descriptor.
    async fn prune(&self, record: &BackupMetadata) -> Result<()> {
        match tokio::fs::remove_file(self.store.artifact_path(&record.filename)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.delete(&record.filename).await {
            Ok(()) | Err(BackupError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Descriptors are listed before artifacts: a create places its artifact
    /// before recording it, so a pair finished mid-scan is never reported as a
    /// dangling descriptor.
    pub async fn find_orphans(&self) -> Result<Orphans> {
        let descriptors: HashSet<String> = self.store.descriptor_names().await?.into_iter().collect();
        let artifacts = self.store.artifact_files().await?;
        let present: HashSet<&str> = artifacts.iter().map(|a| a.filename.as_str()).collect();

        let mut orphans = Orphans {
            artifacts: artifacts
                .iter()
                .filter(|a| !descriptors.contains(&a.filename))
                .map(|a| a.filename.clone())
                .collect(),
            descriptors: descriptors
                .iter()
                .filter(|d| !present.contains(d.as_str()))
                .cloned()
                .collect(),
        };
        orphans.artifacts.sort();
        orphans.descriptors.sort();
        Ok(orphans)
    }

    /// Delete orphans last written more than `grace` ago. Each one is checked
    /// again just before removal, so a create finishing meanwhile keeps its files.
    pub async fn collect_orphans(&self, grace: Duration) -> Result<Orphans> {
        let _running = self
            .running
            .try_lock()
            .map_err(|_| BackupError::SweepInProgress)?;

        let orphans = self.find_orphans().await?;
        let modified: std::collections::HashMap<String, DateTime<Utc>> = self
            .store
            .artifact_files()
            .await?
            .into_iter()
            .map(|a| (a.filename, a.modified))
            .collect();
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();

        let mut removed = Orphans::default();
        for name in orphans.artifacts {
            if modified.get(&name).map(|m| *m > cutoff).unwrap_or(true) {
                continue;
            }
            if self.store.has_descriptor(&name).await? {
                continue;
            }
            match tokio::fs::remove_file(self.store.artifact_path(&name)).await {
                Ok(()) => removed.artifacts.push(name),
                Err(e) => warn!(filename = %name, error = %e, "Failed to remove orphan artifact"),
            }
        }
        for name in orphans.descriptors {
            match self.store.descriptor_modified(&name).await {
                Ok(written) if written > cutoff => continue,
                Ok(_) => {}
                Err(BackupError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
            if tokio::fs::try_exists(self.store.artifact_path(&name)).await? {
                continue;
            }
            match self.store.delete(&name).await {
                Ok(()) => removed.descriptors.push(name),
                Err(e) => warn!(filename = %name, error = %e, "Failed to remove dangling descriptor"),
            }
        }

        if !removed.is_empty() {
            info!(
                artifacts = removed.artifacts.len(),
                descriptors = removed.descriptors.len(),
                "Collected orphans"
            );
        }
        Ok(removed)
    }
}
