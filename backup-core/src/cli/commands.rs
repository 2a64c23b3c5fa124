use super::{
    output, CleanupArgs, CreateArgs, ListArgs, MonitorArgs, OutputFormat, RestoreArgs, StatusArgs,
    ValidateArgs,
};
use crate::artifact;
use crate::config::Config;
use crate::health::{HealthMonitor, HealthState, StatusSnapshot};
use crate::manager::{BackupManager, CreateRequest, RestoreOptions, CREATE_TIMEOUT, RESTORE_TIMEOUT};
use crate::retention::RetentionPolicy;
use crate::utils::deadline::Deadline;
use crate::utils::format::parse_duration;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code for a command that ran to completion.
pub const EXIT_OK: u8 = 0;
/// Exit code for failures, declined prompts and an unhealthy status.
pub const EXIT_FAILURE: u8 = 1;

async fn manager(config: &Config) -> Result<BackupManager> {
    let manager = BackupManager::from_config(config);
    manager.init().await?;
    Ok(manager)
}

/// Ask a yes/no question on stdin. Anything but `yes`/`y` declines.
async fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let answer = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line).map(|_| line)
    })
    .await
    .context("stdin reader panicked")??;

    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

pub async fn create(config: &Config, args: CreateArgs, cancel: &CancellationToken) -> Result<u8> {
    let manager = manager(config).await?;

    println!("Creating backup: {}", args.description);
    let request = CreateRequest {
        compress: args.compress,
        validate: args.validate,
        ..CreateRequest::new(args.description, args.backup_type)
    };

    let deadline = Deadline::new(cancel, CREATE_TIMEOUT);
    let outcome = manager
        .create_backup(request, deadline.token())
        .await
        .context("Backup creation failed")?;

    print!("{}", output::backup_created(&outcome, args.verbose));
    Ok(EXIT_OK)
}

pub async fn restore(config: &Config, args: RestoreArgs, cancel: &CancellationToken) -> Result<u8> {
    let Some(filename) = args.file else {
        println!("❌ Error: --file parameter is required");
        println!("Use 'backup-admin list' to see available backups");
        return Ok(EXIT_FAILURE);
    };

    let manager = manager(config).await?;
    // Fail on a bad or unknown name before asking anything.
    artifact::validate_filename(&filename)?;
    if !tokio::fs::try_exists(manager.store().artifact_path(&filename)).await? {
        bail!("backup not found: {}", filename);
    }
    let backup = manager.get_backup(&filename).await;

    if !args.yes {
        println!("⚠️  WARNING: This will replace the current database contents!");
        let db = &config.database;
        println!("Database: {}@{}:{}/{}", db.user, db.host, db.port, db.name);
        println!("Backup: {}", filename);
        if let Ok(meta) = &backup {
            println!("Created: {}", meta.created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
        }
        if !confirm("Continue? (yes/no): ").await? {
            println!("Restore cancelled.");
            return Ok(EXIT_FAILURE);
        }
    }

    println!("🔄 Starting restore operation...");
    let options = RestoreOptions {
        skip_safety_backup: args.skip_safety_backup,
    };
    let deadline = Deadline::new(cancel, RESTORE_TIMEOUT);
    let outcome = match manager.restore_backup(&filename, options, deadline.token()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            print!("{}", output::restore_failed(&e));
            return Err(anyhow::Error::new(e).context("Restore failed"));
        }
    };

    print!("{}", output::restore_completed(&outcome));
    Ok(EXIT_OK)
}

pub async fn list(config: &Config, args: ListArgs) -> Result<u8> {
    let manager = manager(config).await?;
    let limit = (args.limit > 0).then_some(args.limit);
    let records = manager.list_backups(args.sort, limit).await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Table => print!("{}", output::backup_table(&records, args.verbose, Utc::now())),
    }
    Ok(EXIT_OK)
}

pub async fn validate(config: &Config, args: ValidateArgs) -> Result<u8> {
    let Some(filename) = args.file else {
        println!("❌ Error: --file parameter is required");
        println!("Use 'backup-admin list' to see available backups");
        return Ok(EXIT_FAILURE);
    };

    let manager = manager(config).await?;
    let report = manager.validate_backup(&filename).await?;
    print!("{}", output::validation(&report, args.verbose));

    Ok(if report.valid { EXIT_OK } else { EXIT_FAILURE })
}

/// Policy from the flags, or the configured one when no flag is given.
fn cleanup_policy(config: &Config, args: &CleanupArgs) -> Result<RetentionPolicy> {
    if args.older_than.is_none() && args.max_count.is_none() {
        return Ok(config.retention_policy());
    }

    let max_age = args
        .older_than
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    if max_age == Some(Duration::ZERO) {
        bail!("--older-than must be positive");
    }
    if args.max_count == Some(0) {
        bail!("--max-count must be at least 1");
    }
    Ok(RetentionPolicy {
        max_age,
        max_count: args.max_count,
    })
}

fn describe_policy(policy: &RetentionPolicy) -> String {
    let mut parts = Vec::new();
    if let Some(age) = policy.max_age {
        parts.push(format!("older than {}", humantime::format_duration(age)));
    }
    if let Some(count) = policy.max_count {
        parts.push(format!("beyond the newest {}", count));
    }
    parts.join(" or ")
}

pub async fn cleanup(config: &Config, args: CleanupArgs) -> Result<u8> {
    let policy = cleanup_policy(config, &args)?;
    if policy.is_unbounded() {
        println!("No retention limits configured; nothing to clean up.");
        return Ok(EXIT_OK);
    }

    let manager = manager(config).await?;
    let plan = manager.sweep(Some(policy), true).await?;
    if plan.candidates.is_empty() {
        println!("No backups to clean up.");
        return Ok(EXIT_OK);
    }

    print!("{}", output::cleanup_plan(&plan, &describe_policy(&policy)));
    if args.dry_run {
        println!("(Dry run - no files were deleted)");
        return Ok(EXIT_OK);
    }

    if !args.yes && !confirm("Delete these backups? (yes/no): ").await? {
        println!("Cleanup cancelled.");
        return Ok(EXIT_FAILURE);
    }

    let report = manager.sweep(Some(policy), false).await?;
    print!("{}", output::cleanup_done(&report));
    Ok(if report.errors.is_empty() { EXIT_OK } else { EXIT_FAILURE })
}

async fn snapshot(manager: &BackupManager, config: &Config) -> StatusSnapshot {
    let monitor = HealthMonitor::new(manager.store().clone(), manager.history(), config.health.clone());
    monitor.snapshot(None).await
}

pub async fn status(config: &Config, args: StatusArgs) -> Result<u8> {
    let manager = BackupManager::from_config(config);
    let snapshot = snapshot(&manager, config).await;

    let orphans = if args.detailed {
        manager.sweeper().find_orphans().await.unwrap_or_default()
    } else {
        Default::default()
    };
    let detailed = args.detailed.then_some((config, &orphans));

    match args.format {
        OutputFormat::Json => println!("{}", output::status_json(&snapshot, detailed)?),
        OutputFormat::Table => print!("{}", output::status(&snapshot, detailed, Utc::now())),
    }

    Ok(if snapshot.health.overall == HealthState::Down {
        EXIT_FAILURE
    } else {
        EXIT_OK
    })
}

pub async fn monitor(config: &Config, args: MonitorArgs, cancel: &CancellationToken) -> Result<u8> {
    let interval = parse_duration(&args.interval).map_err(anyhow::Error::msg)?;
    if interval.is_zero() {
        bail!("--interval must be positive");
    }

    let manager = BackupManager::from_config(config);
    println!("Starting backup monitoring (interval: {})", humantime::format_duration(interval));
    println!("Press Ctrl+C to stop");

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = snapshot(&manager, config).await;
                println!("{}", output::monitor_line(&snapshot));
            }
        }
    }

    println!("Monitoring stopped.");
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleanup_args(older_than: Option<&str>, max_count: Option<usize>) -> CleanupArgs {
        CleanupArgs {
            older_than: older_than.map(String::from),
            max_count,
            dry_run: true,
            yes: false,
        }
    }

    #[test]
    fn test_affirmative_answers() {
        assert!(is_affirmative("yes\n"));
        assert!(is_affirmative(" Y "));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("yess"));
    }

    #[test]
    fn test_cleanup_policy_falls_back_to_config() {
        let config = Config::default();
        let policy = cleanup_policy(&config, &cleanup_args(None, None)).unwrap();
        assert_eq!(policy, config.retention_policy());
    }

    #[test]
    fn test_cleanup_policy_from_flags() {
        let config = Config::default();

        let policy = cleanup_policy(&config, &cleanup_args(Some("7d"), None)).unwrap();
        assert_eq!(policy.max_age, Some(Duration::from_secs(7 * 86_400)));
        assert_eq!(policy.max_count, None);
        assert_eq!(describe_policy(&policy), "older than 7days");

        let policy = cleanup_policy(&config, &cleanup_args(None, Some(5))).unwrap();
        assert_eq!(policy.max_age, None);
        assert_eq!(describe_policy(&policy), "beyond the newest 5");

        assert!(cleanup_policy(&config, &cleanup_args(Some("soon"), None)).is_err());
        assert!(cleanup_policy(&config, &cleanup_args(None, Some(0))).is_err());
    }

    #[tokio::test]
    async fn test_cleanup_dry_run_deletes_nothing() {
        use crate::testing::FakeDatabase;
        use std::sync::Arc;

        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.backup.dir = dir.path().to_path_buf();

        let db = Arc::new(FakeDatabase::default());
        let manager = BackupManager::new(&config, db.clone(), db);
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            manager
                .create_backup(CreateRequest::new("t", Default::default()), &cancel)
                .await
                .unwrap();
        }

        let code = cleanup(&config, cleanup_args(None, Some(1))).await.unwrap();
        assert_eq!(code, EXIT_OK);
        assert_eq!(manager.list_backups(Default::default(), None).await.unwrap().len(), 3);
    }
}
