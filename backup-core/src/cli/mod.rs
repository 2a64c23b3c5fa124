//! `backup-admin` command line.

pub mod commands;
pub mod output;

use crate::config::Config;
use crate::metadata::{BackupType, SortKey};
use crate::utils::logger;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "backup-admin", author, version, about = "Database backup administration", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new backup
    Create(CreateArgs),
    /// Restore the database from a backup
    Restore(RestoreArgs),
    /// List available backups
    List(ListArgs),
    /// Check a backup's checksum and content
    Validate(ValidateArgs),
    /// Delete old backups
    Cleanup(CleanupArgs),
    /// Show backup system health
    Status(StatusArgs),
    /// Print health periodically until interrupted
    Monitor(MonitorArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Free-text description stored with the backup
    #[arg(short, long, default_value = "Manual backup")]
    pub description: String,

    #[arg(short = 't', long = "type", value_enum, default_value_t = BackupType::Manual)]
    pub backup_type: BackupType,

    /// Compress the artifact (defaults to the configured setting)
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub compress: Option<bool>,

    /// Validate the artifact after writing it (defaults to the configured setting)
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub validate: Option<bool>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Backup filename to restore
    #[arg(short, long)]
    pub file: Option<String>,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Do not take a safety backup of the current database first
    #[arg(long)]
    pub skip_safety_backup: bool,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(short, long, value_enum, default_value_t = SortKey::Date)]
    pub sort: SortKey,

    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Backup filename to validate
    #[arg(short, long)]
    pub file: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Delete backups older than this (e.g. 30d, 12h); defaults to the configured retention
    #[arg(long)]
    pub older_than: Option<String>,

    /// Keep at most this many of the newest backups
    #[arg(long)]
    pub max_count: Option<usize>,

    /// Report what would be deleted without deleting anything
    #[arg(long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Include configuration and orphaned files
    #[arg(short, long)]
    pub detailed: bool,

    #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    /// Time between checks (e.g. 30s, 5m)
    #[arg(short, long, default_value = "30s")]
    pub interval: String,
}

/// Run the parsed command line. Returns the process exit code.
pub async fn run(cli: Cli) -> u8 {
    if let Command::Version = cli.command {
        println!("backup-admin version {}", env!("CARGO_PKG_VERSION"));
        return 0;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return 1;
        }
    };

    let level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = logger::init(level, &config.log.format) {
        eprintln!("❌ Failed to initialise logging: {}", e);
        return 1;
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = match cli.command {
        Command::Create(args) => commands::create(&config, args, &cancel).await,
        Command::Restore(args) => commands::restore(&config, args, &cancel).await,
        Command::List(args) => commands::list(&config, args).await,
        Command::Validate(args) => commands::validate(&config, args).await,
        Command::Cleanup(args) => commands::cleanup(&config, args).await,
        Command::Status(args) => commands::status(&config, args).await,
        Command::Monitor(args) => commands::monitor(&config, args, &cancel).await,
        Command::Version => Ok(commands::EXIT_OK),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            println!("❌ {:#}", e);
            1
        }
    }
}
