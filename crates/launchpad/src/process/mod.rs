//! External process execution
//!
//! Runs one-shot commands (install, setup, build) to completion and launches
//! the long-running server. Every spawned command leads its own process group
//! so termination reaches the whole tree a package manager starts.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

pub use crate::process::command::{CommandSpec, check_allowed, parse_command_line};
pub use crate::process::launcher::{LaunchError, LaunchState, ServerProcess, launch};
use crate::types::CommandResult;

mod command;
mod launcher;

/// Most bytes kept from a single output stream
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

/// How long to wait for output pipes to close once the process is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that occur while preparing a command
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("refusing to run '{command}': {reason}")]
    UnsafeCommand { command: String, reason: String },

    #[error("program '{0}' is not on the allow-list")]
    ProgramNotAllowed(String),
}

/// Run a command to completion and capture its output
///
/// Never fails: spawn errors, non-zero exits and timeouts all come back as an
/// unsuccessful [`CommandResult`]. When `timeout` elapses the whole process
/// group is killed and the result's error is `"timeout"`.
#[instrument(skip(spec), fields(command = %spec.display()))]
pub async fn run_command(spec: &CommandSpec, timeout: Option<Duration>) -> CommandResult {
    let mut child = match spec.build().spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "failed to spawn command");
            return CommandResult::failed(format!(
                "failed to spawn '{}': {e}",
                spec.program()
            ));
        }
    };
    let pid = child.id();

    let stdout_task = child
        .stdout
        .take()
        .map(|stdout| tokio::spawn(read_bounded(stdout, MAX_CAPTURE_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_CAPTURE_BYTES)));

    let status = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    match status {
        None => {
            warn!(?timeout, "command timed out, killing process group");
            kill(&mut child, pid).await;
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            CommandResult::timed_out(stdout, stderr)
        }
        Some(Ok(status)) => {
            // Anything the command left behind in its group goes with it
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            debug!(exit_code = ?status.code(), "command finished");
            CommandResult::from_exit(status.code(), stdout, stderr)
        }
        Some(Err(e)) => {
            kill(&mut child, pid).await;
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            CommandResult {
                stdout,
                stderr,
                ..CommandResult::failed(format!("failed to wait for '{}': {e}", spec.program()))
            }
        }
    }
}

/// Read a stream to its end, keeping at most `limit` bytes
///
/// Reading continues past the limit so the writer never blocks on a full pipe.
pub(crate) async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: Option<JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };

    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            // Something outside the process group still holds the pipe open
            task.abort();
            String::new()
        }
    }
}

/// Send `signal` to the process group led by `pid`
#[cfg(unix)]
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and has no memory-safety
    // preconditions; a negative pid addresses the process group.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc != 0 {
        debug!(pgid, signal, "process group already gone");
    }
}

/// Kill a child and its process group immediately
pub(crate) async fn kill(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already exited");
    }
}

/// Ask a child to stop, escalating to a kill after `grace`
pub(crate) async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            // The leader is gone; make sure stragglers in its group are too
            signal_group(pid, libc::SIGKILL);
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    kill(child, pid).await;
}
