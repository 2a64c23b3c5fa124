//! Fixed-wait retry around dump and restore invocations.
//!
//! Only errors classified as transient are retried. Checksum mismatches,
//! cancellation and tool failures surface immediately.

use crate::utils::errors::{BackupError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Pause between a failed attempt and the next one
    pub wait: Duration,
}

/// One failed attempt. Only lives until the operation finishes.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub error: String,
    pub elapsed: Duration,
}

/// A successful result together with how it was reached.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub failures: Vec<RetryAttempt>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
        }
    }

    /// Upper bound on time spent waiting between attempts.
    pub fn max_total_wait(&self) -> Duration {
        self.wait * self.max_attempts.saturating_sub(1)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<Retried<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled(format!(
                    "{} cancelled before attempt {}",
                    label, attempt
                )));
            }

            let started = Instant::now();
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = label, attempt, "Succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        failures,
                    });
                }
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    let failed = RetryAttempt {
                        attempt,
                        error: err.to_string(),
                        elapsed: started.elapsed(),
                    };
                    warn!(
                        operation = label,
                        attempt = failed.attempt,
                        max_attempts = self.max_attempts,
                        elapsed_ms = failed.elapsed.as_millis() as u64,
                        error = %failed.error,
                        "Attempt failed"
                    );
                    failures.push(failed);

                    if attempt >= self.max_attempts {
                        return Err(BackupError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }

                    tokio::select! {
                        _ = tokio::time::sleep(self.wait) => {}
                        _ = cancel.cancelled() => {
                            return Err(BackupError::Cancelled(format!(
                                "{} cancelled while waiting to retry", label
                            )));
                        }
                    }
                }
            }
        }
    }
}
