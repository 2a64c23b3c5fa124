//! Supervision of external dump/restore processes.
//!
//! A process is never abandoned: each tool runs in its own process group, and
//! on cancellation the whole group receives SIGTERM, then SIGKILL once the
//! grace period runs out. The direct child is always reaped.

use crate::utils::errors::{BackupError, Result};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Keep at most this much of a tool's stderr.
const STDERR_TAIL: usize = 64 * 1024;

/// How long a cancelled run waits for the stderr reader before abandoning it.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// stderr fragments that indicate the database was unreachable rather than the dump being bad.
const TRANSIENT_MARKERS: &[&str] = &[
    "could not connect",
    "connection refused",
    "timeout expired",
    "timed out",
    "server closed the connection unexpectedly",
    "the database system is starting up",
    "could not translate host name",
];

/// Run `command` to completion, feeding each stdout line to `on_stdout_line`.
///
/// Returns the captured stderr on success.
pub async fn run_supervised<F>(
    tool: &str,
    mut command: Command,
    cancel: &CancellationToken,
    grace: Duration,
    on_stdout_line: &mut F,
) -> Result<String>
where
    F: FnMut(&str),
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled(format!("{} not started", tool)));
    }

    let mut child = command
        .spawn()
        .map_err(|e| BackupError::TransientIo(format!("failed to start {}: {}", tool, e)))?;
    debug!(tool, pid = ?child.id(), "Spawned external process");

    let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));
    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());

    let status = loop {
        tokio::select! {
            line = next_line(&mut stdout) => match line {
                Some(line) => on_stdout_line(&line),
                None => stdout = None,
            },
            status = child.wait() => break status?,
            _ = cancel.cancelled() => {
                terminate(&mut child, tool, grace).await;
                if let Some(task) = stderr_task {
                    let abort = task.abort_handle();
                    if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
                        debug!(tool, "stderr still open after termination");
                        abort.abort();
                    }
                }
                return Err(BackupError::Cancelled(format!("{} terminated", tool)));
            }
        }
    };

    if let Some(mut lines) = stdout {
        while let Ok(Some(line)) = lines.next_line().await {
            on_stdout_line(&line);
        }
    }

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    if status.success() {
        Ok(stderr)
    } else {
        Err(classify_failure(tool, status, stderr))
    }
}

async fn next_line(lines: &mut Option<Lines<BufReader<ChildStdout>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > STDERR_TAIL {
                    let excess = tail.len() - STDERR_TAIL;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

async fn terminate(child: &mut Child, tool: &str, grace: Duration) {
    // The child leads its own group, so its pid is the group id.
    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    signal_group(group, Signal::SIGTERM, tool);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!(tool, "Process exited after SIGTERM"),
        Err(_) => {
            warn!(tool, grace_secs = grace.as_secs(), "Process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(tool, error = %e, "Failed to kill process");
            }
        }
    }

    // Helpers spawned by the tool may outlive it and hold its pipes open.
    signal_group(group, Signal::SIGKILL, tool);
}

fn signal_group(group: Option<Pid>, signal: Signal, tool: &str) {
    let Some(group) = group else { return };
    match killpg(group, signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => debug!(tool, pgid = group.as_raw(), error = %e, "Signalling process group failed"),
    }
}

/// Nonzero exit: connection problems are transient, anything else is a tool failure.
pub fn classify_failure(tool: &str, status: ExitStatus, stderr: String) -> BackupError {
    let lowered = stderr.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        return BackupError::TransientIo(format!("{}: {}", tool, stderr));
    }

    let status = match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "signal".to_string(),
    };
    BackupError::ToolFailed {
        tool: tool.to_string(),
        status,
        stderr,
    }
}
