//! Dump and restore executors.
//!
//! [`Dumper`] and [`Restorer`] are the seams between the backup pipeline and
//! the database tooling. [`PgExecutor`] drives `pg_dump` and `psql`; tests
//! substitute an in-memory fake. Executors never retry on their own.

pub mod process;

use crate::config::DatabaseConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct DumpOutput {
    pub bytes_written: u64,
    pub duration: Duration,
}

/// What a restore reported doing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStats {
    pub tables_affected: u64,
    pub records_affected: u64,
    pub warnings: Vec<String>,
}

impl RestoreStats {
    /// Fold one line of restore tool output into the counters.
    ///
    /// `CREATE TABLE` counts a table, `COPY n` and `INSERT 0 n` add records,
    /// `WARNING:`/`NOTICE:` lines are kept as warnings.
    pub fn observe_line(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        if line.contains("WARNING:") || line.contains("NOTICE:") {
            self.warnings.push(line.to_string());
            return;
        }

        if line == "CREATE TABLE" {
            self.tables_affected += 1;
        } else if let Some(rest) = line.strip_prefix("COPY ") {
            if let Ok(n) = rest.trim().parse::<u64>() {
                self.records_affected += n;
            }
        } else if let Some(rest) = line.strip_prefix("INSERT ") {
            // INSERT <oid> <rows>
            if let Some(Ok(n)) = rest.split_whitespace().nth(1).map(str::parse::<u64>) {
                self.records_affected += n;
            }
        }
    }
}

#[async_trait]
pub trait Dumper: Send + Sync {
    /// Write a complete plain-SQL dump of the database to `output`.
    async fn create_dump(&self, output: &Path, cancel: &CancellationToken) -> Result<DumpOutput>;
}

#[async_trait]
pub trait Restorer: Send + Sync {
    /// Replay a plain-SQL dump from `input` into the database.
    async fn restore_dump(&self, input: &Path, cancel: &CancellationToken) -> Result<RestoreStats>;
}

/// `pg_dump`/`psql` against one configured database.
///
/// Tool binaries are resolved when first needed, so commands that never
/// touch the database work without them installed.
#[derive(Debug, Clone)]
pub struct PgExecutor {
    db: DatabaseConfig,
    grace: Duration,
}

impl PgExecutor {
    pub fn new(db: &DatabaseConfig, grace: Duration) -> Self {
        Self {
            db: db.clone(),
            grace,
        }
    }

    fn command(&self, program: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg(format!("--host={}", self.db.host))
            .arg(format!("--port={}", self.db.port))
            .arg(format!("--username={}", self.db.user))
            .arg(format!("--dbname={}", self.db.name))
            .arg("--no-password")
            .env("PGCLIENTENCODING", "UTF8");
        if !self.db.password.is_empty() {
            cmd.env("PGPASSWORD", &self.db.password);
        }
        cmd
    }

    fn dump_command(&self, output: &Path) -> Result<Command> {
        let pg_dump = resolve_tool(self.db.pg_dump_path.as_ref(), "pg_dump")?;
        let mut cmd = self.command(&pg_dump);
        cmd.args([
            "--format=plain",
            "--encoding=UTF8",
            "--clean",
            "--if-exists",
            "--no-owner",
            "--no-privileges",
        ])
        .arg(format!("--file={}", output.display()));
        Ok(cmd)
    }

    fn restore_command(&self, input: &Path) -> Result<Command> {
        let psql = resolve_tool(self.db.psql_path.as_ref(), "psql")?;
        let mut cmd = self.command(&psql);
        cmd.args(["--no-psqlrc", "--set=ON_ERROR_STOP=1"])
            .arg(format!("--file={}", input.display()));
        Ok(cmd)
    }
}

fn resolve_tool(explicit: Option<&PathBuf>, name: &str) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.clone()),
        None => which::which(name)
            .map_err(|e| BackupError::Config(format!("{} not found on PATH: {}", name, e))),
    }
}

#[async_trait]
impl Dumper for PgExecutor {
    async fn create_dump(&self, output: &Path, cancel: &CancellationToken) -> Result<DumpOutput> {
        let started = Instant::now();
        info!(database = %self.db.name, output = %output.display(), "Starting pg_dump");

        process::run_supervised(
            "pg_dump",
            self.dump_command(output)?,
            cancel,
            self.grace,
            &mut |line: &str| debug!(line, "pg_dump"),
        )
        .await?;

        let bytes_written = tokio::fs::metadata(output).await?.len();
        Ok(DumpOutput {
            bytes_written,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Restorer for PgExecutor {
    async fn restore_dump(&self, input: &Path, cancel: &CancellationToken) -> Result<RestoreStats> {
        info!(database = %self.db.name, input = %input.display(), "Starting psql restore");

        let mut stats = RestoreStats::default();
        let stderr = process::run_supervised(
            "psql",
            self.restore_command(input)?,
            cancel,
            self.grace,
            &mut |line: &str| stats.observe_line(line),
        )
        .await?;

        for line in stderr.lines() {
            stats.observe_line(line);
        }
        Ok(stats)
    }
}
