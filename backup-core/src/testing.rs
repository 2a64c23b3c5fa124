//! In-memory database double for tests.

use crate::executor::{DumpOutput, Dumper, RestoreStats, Restorer};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const SAMPLE_SQL: &str = "\
SET client_encoding = 'UTF8';
DROP TABLE IF EXISTS words;
CREATE TABLE words (id integer PRIMARY KEY, text text NOT NULL);
INSERT INTO words VALUES (1, 'apple');
INSERT INTO words VALUES (2, 'banana');
INSERT INTO words VALUES (3, 'cherry');
";

#[derive(Debug, Default)]
struct FakeState {
    contents: Vec<u8>,
    transient_dump_failures: u32,
    transient_restore_failures: u32,
    rejected_restores: u32,
    broken: bool,
    delay: Duration,
    dump_calls: u32,
    restore_calls: u32,
}

/// Dumps write the current contents verbatim; restores replace them.
#[derive(Debug)]
pub struct FakeDatabase {
    state: Mutex<FakeState>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        Self::new(SAMPLE_SQL)
    }
}

impl FakeDatabase {
    pub fn new(contents: impl Into<Vec<u8>>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                contents: contents.into(),
                ..FakeState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state().contents.clone()
    }

    pub fn set_contents(&self, contents: impl Into<Vec<u8>>) {
        self.state().contents = contents.into();
    }

    /// The next `k` dumps fail with a transient error.
    pub fn fail_next_dumps(&self, k: u32) {
        self.state().transient_dump_failures = k;
    }

    /// The next `k` restores fail with a transient error.
    pub fn fail_next_restores(&self, k: u32) {
        self.state().transient_restore_failures = k;
    }

    /// The next `k` restores fail permanently, as a SQL error would.
    pub fn reject_next_restores(&self, k: u32) {
        self.state().rejected_restores = k;
    }

    /// Every call fails permanently until cleared.
    pub fn set_broken(&self, broken: bool) {
        self.state().broken = broken;
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = delay;
    }

    pub fn dump_calls(&self) -> u32 {
        self.state().dump_calls
    }

    pub fn restore_calls(&self) -> u32 {
        self.state().restore_calls
    }

    async fn pause(&self, cancel: &CancellationToken, what: &str) -> Result<()> {
        let delay = self.state().delay;
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(BackupError::Cancelled(format!("fake {} terminated", what))),
        }
    }
}

fn tool_failure(tool: &str, stderr: &str) -> BackupError {
    BackupError::ToolFailed {
        tool: tool.to_string(),
        status: "exit code 1".to_string(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl Dumper for FakeDatabase {
    async fn create_dump(&self, output: &Path, cancel: &CancellationToken) -> Result<DumpOutput> {
        let started = Instant::now();
        let contents = {
            let mut state = self.state();
            state.dump_calls += 1;
            if state.broken {
                return Err(tool_failure("fake_dump", "permission denied for table words"));
            }
            if state.transient_dump_failures > 0 {
                state.transient_dump_failures -= 1;
                return Err(BackupError::TransientIo("connection refused".into()));
            }
            state.contents.clone()
        };

        self.pause(cancel, "dump").await?;
        tokio::fs::write(output, &contents).await?;

        Ok(DumpOutput {
            bytes_written: contents.len() as u64,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl Restorer for FakeDatabase {
    async fn restore_dump(&self, input: &Path, cancel: &CancellationToken) -> Result<RestoreStats> {
        {
            let mut state = self.state();
            state.restore_calls += 1;
            if state.broken {
                return Err(tool_failure("fake_restore", "database is read-only"));
            }
            if state.transient_restore_failures > 0 {
                state.transient_restore_failures -= 1;
                return Err(BackupError::TransientIo("connection refused".into()));
            }
            if state.rejected_restores > 0 {
                state.rejected_restores -= 1;
                return Err(tool_failure("fake_restore", "ERROR: syntax error at or near \"BROKEN\""));
            }
        }

        self.pause(cancel, "restore").await?;
        let contents = tokio::fs::read(input).await?;

        let mut stats = RestoreStats::default();
        for line in String::from_utf8_lossy(&contents).lines() {
            if line.starts_with("CREATE TABLE") {
                stats.tables_affected += 1;
            } else if line.starts_with("INSERT INTO") {
                stats.records_affected += 1;
            }
        }

        self.state().contents = contents;
        Ok(stats)
    }
}
