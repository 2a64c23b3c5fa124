//! Cancellation tokens that also fire when a deadline passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A child of the caller's token that is cancelled after `timeout`.
///
/// Dropping the deadline cancels the child token and stops the timer.
pub struct Deadline {
    token: CancellationToken,
    expired: Arc<AtomicBool>,
    timeout: Duration,
    _guard: DropGuard,
}

impl Deadline {
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let expired = Arc::new(AtomicBool::new(false));

        let timer_token = token.clone();
        let timer_expired = Arc::clone(&expired);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    timer_expired.store(true, Ordering::SeqCst);
                    timer_token.cancel();
                }
                _ = timer_token.cancelled() => {}
            }
        });

        Self {
            _guard: token.clone().drop_guard(),
            token,
            expired,
            timeout,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Reason string for a `Cancelled` error raised under this deadline.
    pub fn cancel_reason(&self) -> String {
        if self.expired() {
            format!("deadline of {}s exceeded", self.timeout.as_secs())
        } else {
            "cancelled by caller".to_string()
        }
    }
}
