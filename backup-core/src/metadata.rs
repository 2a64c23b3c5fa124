//! Backup descriptors, stored as `{artifact}.meta.json` sidecars next to each artifact.
//!
//! Sidecars are written to a unique temporary file and renamed into place,
//! so concurrent readers never see a partial descriptor.

use crate::artifact::{is_artifact_name, validate_filename};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;
use walkdir::WalkDir;

const SIDECAR_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Manual,
    Automatic,
    Migration,
    /// Taken automatically right before a restore
    Safety,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Automatic => "automatic",
            BackupType::Migration => "migration",
            BackupType::Safety => "safety",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "manual" => Ok(BackupType::Manual),
            "automatic" => Ok(BackupType::Automatic),
            "migration" => Ok(BackupType::Migration),
            "safety" => Ok(BackupType::Safety),
            other => Err(format!("unknown backup type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub filename: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    pub backup_type: BackupType,
    pub compressed: bool,
    #[serde(default)]
    pub encrypted: bool,
    pub validated: bool,
    /// Hex SHA-256 of the artifact bytes as stored on disk
    pub checksum: String,
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Newest first
    #[default]
    Date,
    /// Alphabetical
    Name,
    /// Largest first
    Size,
}

impl FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "date" => Ok(SortKey::Date),
            "name" => Ok(SortKey::Name),
            "size" => Ok(SortKey::Size),
            other => Err(format!("unknown sort key '{}'", other)),
        }
    }
}

/// Orders descriptors by `key`, breaking ties by filename.
pub fn sort_records(records: &mut [BackupMetadata], key: SortKey) {
    records.sort_by(|a, b| {
        let primary = match key {
            SortKey::Date => b.created_at.cmp(&a.created_at),
            SortKey::Name => Ordering::Equal,
            SortKey::Size => b.size.cmp(&a.size),
        };
        primary.then_with(|| a.filename.cmp(&b.filename))
    });
}

/// An artifact file found in the backup directory.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub filename: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    fn sidecar_path(&self, filename: &str) -> PathBuf {
        self.dir.join(format!("{}{}", filename, SIDECAR_SUFFIX))
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub async fn record(&self, metadata: &BackupMetadata) -> Result<()> {
        validate_filename(&metadata.filename)?;

        let target = self.sidecar_path(&metadata.filename);
        let tmp = self.dir.join(format!(
            ".{}{}.{}.tmp",
            metadata.filename,
            SIDECAR_SUFFIX,
            Uuid::new_v4().simple()
        ));
        let body = serde_json::to_vec_pretty(metadata)?;

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &body).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &target).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn get(&self, filename: &str) -> Result<BackupMetadata> {
        validate_filename(filename)?;
        let body = tokio::fs::read(self.sidecar_path(filename))
            .await
            .map_err(|e| BackupError::from_io(e, filename))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// All readable descriptors, sorted by `sort` and truncated to `limit`.
    pub async fn list(&self, sort: SortKey, limit: Option<usize>) -> Result<Vec<BackupMetadata>> {
        let dir = self.dir.clone();
        let mut records = tokio::task::spawn_blocking(move || read_descriptors(&dir))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

        sort_records(&mut records, sort);
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub async fn delete(&self, filename: &str) -> Result<()> {
        validate_filename(filename)?;
        tokio::fs::remove_file(self.sidecar_path(filename))
            .await
            .map_err(|e| BackupError::from_io(e, filename))
    }

    /// Whether a sidecar exists for `filename`.
    pub async fn has_descriptor(&self, filename: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.sidecar_path(filename)).await?)
    }

    /// Last write time of the sidecar for `filename`.
    pub async fn descriptor_modified(&self, filename: &str) -> Result<DateTime<Utc>> {
        let meta = tokio::fs::metadata(self.sidecar_path(filename))
            .await
            .map_err(|e| BackupError::from_io(e, filename))?;
        Ok(meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()))
    }

    /// Flip `validated` on an existing descriptor.
    pub async fn mark_validated(&self, filename: &str) -> Result<BackupMetadata> {
        let mut metadata = self.get(filename).await?;
        if !metadata.validated {
            metadata.validated = true;
            self.record(&metadata).await?;
        }
        Ok(metadata)
    }

    /// Artifact files present in the directory, with or without descriptors.
    pub async fn artifact_files(&self) -> Result<Vec<ArtifactFile>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ArtifactFile>> {
            let mut files = Vec::new();
            for entry in scan(&dir)? {
                let name = entry.file_name().to_string_lossy().to_string();
                if !is_artifact_name(&name) {
                    continue;
                }
                let meta = entry.metadata().map_err(std::io::Error::other)?;
                files.push(ArtifactFile {
                    filename: name,
                    size: meta.len(),
                    modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
                });
            }
            Ok(files)
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    /// Artifact names that have a sidecar, whether or not the artifact still exists.
    pub async fn descriptor_names(&self) -> Result<Vec<String>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            Ok(scan(&dir)?
                .into_iter()
                .filter_map(|entry| {
                    let name = entry.file_name().to_string_lossy().to_string();
                    name.strip_suffix(SIDECAR_SUFFIX)
                        .filter(|artifact| is_artifact_name(artifact))
                        .map(str::to_string)
                })
                .collect())
        })
        .await
        .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }
}

fn scan(dir: &Path) -> Result<Vec<walkdir::DirEntry>> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => BackupError::from_io(io, dir.display()),
            None => BackupError::Io(std::io::Error::other("directory walk failed")),
        })?;
        if entry.file_type().is_file() {
            entries.push(entry);
        }
    }
    Ok(entries)
}

fn read_descriptors(dir: &Path) -> Result<Vec<BackupMetadata>> {
    let mut records = Vec::new();
    for entry in scan(dir)? {
        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(SIDECAR_SUFFIX) || name.starts_with('.') {
            continue;
        }
        let parsed = std::fs::read(entry.path())
            .map_err(BackupError::from)
            .and_then(|body| serde_json::from_slice::<BackupMetadata>(&body).map_err(BackupError::from));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %entry.path().display(), error = %e, "Skipping unreadable descriptor"),
        }
    }
    Ok(records)
}
