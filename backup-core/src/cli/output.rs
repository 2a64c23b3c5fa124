//! Text rendering for `backup-admin`.

use crate::config::Config;
use crate::health::StatusSnapshot;
use crate::manager::{BackupOutcome, RestoreOutcome, ValidationReport};
use crate::metadata::BackupMetadata;
use crate::retention::{Orphans, SweepReport};
use crate::utils::errors::BackupError;
use crate::utils::format::{format_age, format_bytes, format_duration};
use chrono::{DateTime, Local, Utc};
use std::fmt::Write;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn local(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn age_of(ts: &DateTime<Utc>, now: DateTime<Utc>) -> String {
    format_age((now - *ts).to_std().unwrap_or_default())
}

pub fn backup_created(outcome: &BackupOutcome, verbose: bool) -> String {
    let meta = &outcome.metadata;
    let mut out = String::new();
    let _ = writeln!(out, "✅ Backup created successfully!");
    let _ = writeln!(out, "   Filename: {}", meta.filename);
    let _ = writeln!(out, "   Size: {}", format_bytes(meta.size));
    let _ = writeln!(out, "   Duration: {}", format_duration(outcome.duration_ms / 1000));
    let _ = writeln!(out, "   Compressed: {}", yes_no(meta.compressed));
    let _ = writeln!(out, "   Validated: {}", yes_no(meta.validated));
    if outcome.attempts > 1 {
        let _ = writeln!(out, "   Attempts: {}", outcome.attempts);
    }
    if verbose {
        let _ = writeln!(out, "   Checksum: {}", meta.checksum);
        let _ = writeln!(out, "   Created: {}", local(&meta.created_at));
    }
    if !meta.warnings.is_empty() {
        let _ = writeln!(out, "   Warnings:");
        for warning in &meta.warnings {
            let _ = writeln!(out, "     - {}", warning);
        }
    }
    out
}

pub fn restore_completed(outcome: &RestoreOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "✅ Database restored successfully!");
    let _ = writeln!(out, "   Backup: {}", outcome.filename);
    let _ = writeln!(out, "   Tables: {}", outcome.tables_affected);
    let _ = writeln!(out, "   Records: {}", outcome.records_affected);
    let _ = writeln!(out, "   Duration: {}", format_duration(outcome.duration_ms / 1000));
    if let Some(safety) = &outcome.safety_backup {
        let _ = writeln!(out, "   Safety backup: {}", safety);
    }
    if !outcome.warnings.is_empty() {
        let _ = writeln!(out, "   Warnings: {}", outcome.warnings.len());
        for warning in &outcome.warnings {
            let _ = writeln!(out, "     - {}", warning);
        }
    }
    out
}

/// Rollback report for a restore that failed after a safety backup; empty otherwise.
pub fn restore_failed(err: &BackupError) -> String {
    let BackupError::RestoreFailed {
        rolled_back,
        safety_backup,
        warnings,
        ..
    } = err
    else {
        return String::new();
    };

    let mut out = String::new();
    if *rolled_back {
        let _ = writeln!(out, "↩️  Database rolled back to safety backup {}", safety_backup);
    } else {
        let _ = writeln!(out, "⚠️  Rollback failed; safety backup kept as {}", safety_backup);
    }
    for warning in warnings {
        let _ = writeln!(out, "     - {}", warning);
    }
    out
}

pub fn backup_table(records: &[BackupMetadata], verbose: bool, now: DateTime<Utc>) -> String {
    if records.is_empty() {
        return "No backups found.\n".to_string();
    }

    let name_width = records
        .iter()
        .map(|r| r.filename.len())
        .max()
        .unwrap_or(0)
        .max("FILENAME".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<name_width$}  {:>10}  {:<19}  {:>5}  {:<9}  DESCRIPTION",
        "FILENAME", "SIZE", "CREATED", "AGE", "TYPE"
    );
    for r in records {
        let _ = writeln!(
            out,
            "{:<name_width$}  {:>10}  {:<19}  {:>5}  {:<9}  {}",
            r.filename,
            format_bytes(r.size),
            local(&r.created_at),
            age_of(&r.created_at, now),
            r.backup_type.as_str(),
            r.description
        );
        if verbose {
            let _ = writeln!(
                out,
                "    checksum={} compressed={} validated={}",
                r.checksum,
                yes_no(r.compressed),
                yes_no(r.validated)
            );
        }
    }

    let total: u64 = records.iter().map(|r| r.size).sum();
    let _ = writeln!(out, "\n{} backups, {}", records.len(), format_bytes(total));
    out
}

pub fn validation(report: &ValidationReport, verbose: bool) -> String {
    let mut out = String::new();
    if report.valid {
        let _ = writeln!(out, "✅ Backup is valid: {}", report.filename);
    } else {
        let _ = writeln!(out, "❌ Backup is invalid: {}", report.filename);
    }
    let _ = writeln!(out, "   Size: {}", format_bytes(report.size));
    let checksum = match report.checksum_matches {
        Some(true) => "match",
        Some(false) => "MISMATCH",
        None => "no descriptor",
    };
    let _ = writeln!(out, "   Checksum: {}", checksum);
    let _ = writeln!(out, "   Content: {}", if report.content_valid { "SQL" } else { "unrecognised" });
    if verbose {
        let _ = writeln!(out, "   Actual: {}", report.checksum);
        if let Some(expected) = &report.expected_checksum {
            let _ = writeln!(out, "   Expected: {}", expected);
        }
    }
    if !report.issues.is_empty() {
        let _ = writeln!(out, "   Issues:");
        for issue in &report.issues {
            let _ = writeln!(out, "     - {}", issue);
        }
    }
    out
}

/// Candidate listing shown before a cleanup is confirmed.
pub fn cleanup_plan(report: &SweepReport, criteria: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Found {} backups {}:", report.candidates.len(), criteria);
    for candidate in &report.candidates {
        let _ = writeln!(
            out,
            "  - {} ({}, {})",
            candidate.filename,
            format_bytes(candidate.size),
            local(&candidate.created_at)
        );
    }
    let total: u64 = report.candidates.iter().map(|c| c.size).sum();
    let _ = writeln!(out, "\nTotal size to be freed: {}", format_bytes(total));
    out
}

pub fn cleanup_done(report: &SweepReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "✅ Cleanup completed: {} backups deleted, {} freed",
        report.deleted_count,
        format_bytes(report.bytes_freed)
    );
    if !report.errors.is_empty() {
        let _ = writeln!(out, "⚠️  {} deletions failed:", report.errors.len());
        for err in &report.errors {
            let _ = writeln!(out, "     - {}", err);
        }
    }
    out
}

pub fn status(
    snapshot: &StatusSnapshot,
    detailed: Option<(&Config, &Orphans)>,
    now: DateTime<Utc>,
) -> String {
    let health = &snapshot.health;
    let metrics = &snapshot.metrics;

    let mut out = String::new();
    let _ = writeln!(out, "Backup System Status");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out, "Overall Health: {}", health.overall);
    if !health.issues.is_empty() {
        let _ = writeln!(out, "Issues:");
        for issue in &health.issues {
            let _ = writeln!(out, "  - {}", issue);
        }
    }

    let _ = writeln!(out, "\nBackup Statistics:");
    let _ = writeln!(out, "  Total Backups: {}", metrics.total_backups);
    let _ = writeln!(out, "  Total Size: {}", format_bytes(metrics.total_size_bytes));
    match &metrics.newest_backup {
        Some(ts) => {
            let _ = writeln!(out, "  Last Backup: {} ({} ago)", local(ts), age_of(ts, now));
        }
        None => {
            let _ = writeln!(out, "  Last Backup: never");
        }
    }
    if let Some(ts) = &metrics.oldest_backup {
        let _ = writeln!(out, "  Oldest Backup: {}", local(ts));
    }
    if let Some(disk) = &metrics.disk {
        let _ = writeln!(out, "  Disk Usage: {:.1}%", disk.used_percent);
        let _ = writeln!(out, "  Available Space: {}", format_bytes(disk.available_bytes));
    }
    if let Some(next) = &snapshot.next_scheduled_run {
        let _ = writeln!(out, "  Next Scheduled Run: {} ({})", local(&next.at), next.schedule_id);
    }
    let _ = writeln!(out, "  Last Check: {}", local(&health.checked_at));

    if let Some((config, orphans)) = detailed {
        let _ = writeln!(out, "\nConfiguration:");
        let _ = writeln!(out, "  Backup Directory: {}", config.backup.dir.display());
        let _ = writeln!(
            out,
            "  Database: {}@{}:{}/{}",
            config.database.user, config.database.host, config.database.port, config.database.name
        );
        let compression = if config.backup.compress {
            format!("{:?} (level {})", config.backup.compression, config.backup.compression_level)
        } else {
            "off".to_string()
        };
        let _ = writeln!(out, "  Compression: {}", compression);
        let _ = writeln!(out, "  Max Retries: {}", config.backup.max_retries);
        let _ = writeln!(out, "  Timeout: {}", humantime::format_duration(config.backup.timeout));
        let max_age = config
            .retention
            .max_age
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "unlimited".to_string());
        let max_count = config
            .retention
            .max_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string());
        let _ = writeln!(out, "  Retention: max age {}, max count {}", max_age, max_count);

        if !orphans.is_empty() {
            let _ = writeln!(out, "\nOrphaned Files:");
            for name in &orphans.artifacts {
                let _ = writeln!(out, "  - {} (no descriptor)", name);
            }
            for name in &orphans.descriptors {
                let _ = writeln!(out, "  - {} (descriptor without backup)", name);
            }
        }
    }
    out
}

/// JSON form of `status`; `--detailed` adds the configuration and orphans.
pub fn status_json(
    snapshot: &StatusSnapshot,
    detailed: Option<(&Config, &Orphans)>,
) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(snapshot)?;
    if let (Some((config, orphans)), Some(map)) = (detailed, value.as_object_mut()) {
        let db = &config.database;
        map.insert(
            "configuration".into(),
            serde_json::json!({
                "backupDir": config.backup.dir,
                "database": format!("{}@{}:{}/{}", db.user, db.host, db.port, db.name),
                "compress": config.backup.compress,
                "compression": config.backup.compression,
                "compressionLevel": config.backup.compression_level,
                "maxRetries": config.backup.max_retries,
                "timeout": humantime::format_duration(config.backup.timeout).to_string(),
                "retention": config.retention,
            }),
        );
        map.insert("orphans".into(), serde_json::to_value(orphans)?);
    }
    serde_json::to_string_pretty(&value)
}

pub fn monitor_line(snapshot: &StatusSnapshot) -> String {
    format!(
        "[{}] Health: {} (Issues: {})",
        local(&snapshot.health.checked_at),
        snapshot.health.overall,
        snapshot.health.issues.len()
    )
}
