//! Starting the generated server and waiting for it to come up
//!
//! The server's output is scanned as it arrives on both streams, whether or
//! not a line ending follows. The first readiness phrase seen makes the launch
//! succeed; the process exiting first, or the startup window elapsing, makes
//! it fail.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::process::{CommandSpec, kill, terminate};

/// Most bytes of startup output kept for diagnostics
const MAX_STARTUP_OUTPUT: usize = 64 * 1024;

/// How long to keep collecting output after an early exit
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Size of a single read from a server stream
const CHUNK_SIZE: usize = 8192;

/// Bytes of an unterminated line kept to report the line that signalled readiness
const READY_LINE_CONTEXT: usize = 256;

/// Outcomes of a single launch attempt
///
/// The attempt is starting for as long as [`launch`] is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Ready,
    TimedOut,
    ExitedEarly,
}

/// Why a launch did not reach [`LaunchState::Ready`]
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn server process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("startup timeout: no readiness signal within {}s", .after.as_secs())]
    TimedOut { after: Duration, output: String },

    #[error("server exited before becoming ready ({}): {stderr}", exit_description(.exit_code))]
    ExitedEarly {
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl LaunchError {
    /// Terminal state this error corresponds to
    pub fn state(&self) -> LaunchState {
        match self {
            LaunchError::TimedOut { .. } => LaunchState::TimedOut,
            LaunchError::Spawn { .. } | LaunchError::ExitedEarly { .. } => {
                LaunchState::ExitedEarly
            }
        }
    }

    /// Output captured before the failure
    pub fn output(&self) -> Option<String> {
        match self {
            LaunchError::Spawn { .. } => None,
            LaunchError::TimedOut { output, .. } => Some(output.clone()),
            LaunchError::ExitedEarly { stdout, stderr, .. } => {
                Some(format!("{stdout}{stderr}"))
            }
        }
    }
}

fn exit_description(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug)]
struct OutputChunk {
    stream: Stream,
    bytes: Vec<u8>,
}

/// Finds readiness phrases in output that arrives in arbitrary chunks
///
/// Phrases are matched within a line. The unterminated end of the previous
/// chunk is carried over, so a phrase split between reads still matches.
#[derive(Debug)]
struct ReadinessScanner<'a> {
    phrases: Vec<&'a [u8]>,
    carry: usize,
    partial: Vec<u8>,
}

impl<'a> ReadinessScanner<'a> {
    fn new(phrases: &'a [String]) -> Self {
        let phrases: Vec<&[u8]> = phrases
            .iter()
            .map(|phrase| phrase.as_bytes())
            .filter(|phrase| !phrase.is_empty())
            .collect();
        let longest = phrases.iter().map(|phrase| phrase.len()).max().unwrap_or(0);
        Self {
            phrases,
            carry: longest.saturating_sub(1).max(READY_LINE_CONTEXT),
            partial: Vec::new(),
        }
    }

    /// Scan the next chunk, returning the line holding the first phrase
    fn feed(&mut self, chunk: &[u8]) -> Option<String> {
        let mut window = std::mem::take(&mut self.partial);
        window.extend_from_slice(chunk);

        let found = self
            .phrases
            .iter()
            .filter_map(|phrase| find(&window, phrase).map(|at| (at, phrase.len())))
            .min_by_key(|&(at, _)| at);

        if let Some((at, len)) = found {
            let start = window[..at]
                .iter()
                .rposition(|&b| b == b'\n')
                .map_or(0, |i| i + 1);
            let end = window[at + len..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(window.len(), |i| at + len + i);
            let line = String::from_utf8_lossy(&window[start..end]);
            return Some(line.trim_end().to_string());
        }

        let line_start = window
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        let keep_from = line_start.max(window.len().saturating_sub(self.carry));
        window.drain(..keep_from);
        self.partial = window;
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// A running server process
///
/// Dropping it kills the whole process group; call
/// [`terminate()`](Self::terminate) for a graceful stop.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: Option<u32>,
    port: u16,
    /// The line that signalled readiness
    ready_line: String,
    stopped: bool,
}

impl ServerProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn ready_line(&self) -> &str {
        &self.ready_line
    }

    /// Check whether the process is still alive
    pub fn is_running(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Stop the server: SIGTERM to its process group, SIGKILL after `grace`
    #[instrument(skip(self), fields(pid = ?self.pid, port = self.port))]
    pub async fn terminate(&mut self, grace: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        terminate(&mut self.child, self.pid, grace).await;
        debug!("server process terminated");
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if !self.stopped {
            #[cfg(unix)]
            if let Some(pid) = self.pid {
                crate::process::signal_group(pid, libc::SIGKILL);
            }
            // kill_on_drop covers the direct child everywhere else
        }
    }
}

/// Start a server and wait for it to report readiness
///
/// `spec` should already carry the working directory and the port variable.
/// `phrases` are matched case-sensitively against the output as it arrives.
#[instrument(skip(spec, phrases), fields(command = %spec.display()))]
pub async fn launch(
    spec: &CommandSpec,
    port: u16,
    phrases: &[String],
    startup_timeout: Duration,
) -> Result<ServerProcess, LaunchError> {
    let mut child = spec.build().spawn().map_err(|source| LaunchError::Spawn {
        program: spec.program().to_string(),
        source,
    })?;
    let pid = child.id();

    let (tx, mut rx) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_output(stdout, Stream::Stdout, port, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_output(stderr, Stream::Stderr, port, tx.clone()));
    }
    drop(tx);

    debug!(?pid, port, "server process spawned");

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut stdout_scan = ReadinessScanner::new(phrases);
    let mut stderr_scan = ReadinessScanner::new(phrases);
    let mut streams_open = true;

    let deadline = tokio::time::sleep(startup_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            received = rx.recv(), if streams_open => {
                let Some(OutputChunk { stream, bytes }) = received else {
                    streams_open = false;
                    continue;
                };

                let ready = match stream {
                    Stream::Stdout => stdout_scan.feed(&bytes),
                    Stream::Stderr => stderr_scan.feed(&bytes),
                };
                if let Some(ready_line) = ready {
                    info!(port, line = %ready_line, "server is ready");
                    // Dropping the receiver switches the pumps to drain-only mode
                    drop(rx);
                    return Ok(ServerProcess {
                        child,
                        pid,
                        port,
                        ready_line,
                        stopped: false,
                    });
                }

                match stream {
                    Stream::Stdout => append_bounded(&mut stdout, &bytes),
                    Stream::Stderr => append_bounded(&mut stderr, &bytes),
                }
            }

            status = child.wait() => {
                // Pick up whatever the process printed on its way out
                while let Ok(Some(OutputChunk { stream, bytes })) =
                    tokio::time::timeout(EXIT_DRAIN_TIMEOUT, rx.recv()).await
                {
                    match stream {
                        Stream::Stdout => append_bounded(&mut stdout, &bytes),
                        Stream::Stderr => append_bounded(&mut stderr, &bytes),
                    }
                }

                let exit_code = status.ok().and_then(|s| s.code());
                warn!(?exit_code, "server exited before becoming ready");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    crate::process::signal_group(pid, libc::SIGKILL);
                }
                return Err(LaunchError::ExitedEarly {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }

            () = &mut deadline => {
                warn!(?startup_timeout, "no readiness signal, killing server");
                kill(&mut child, pid).await;
                let mut output = stdout;
                output.extend_from_slice(&stderr);
                return Err(LaunchError::TimedOut {
                    after: startup_timeout,
                    output: String::from_utf8_lossy(&output).into_owned(),
                });
            }
        }
    }
}

/// Forward raw output from `reader` until the launcher stops listening, then
/// keep draining so the server never blocks on a full pipe
async fn pump_output<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    port: u16,
    tx: mpsc::Sender<OutputChunk>,
) {
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut listening = true;

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if listening {
                    let bytes = chunk[..n].to_vec();
                    if tx.send(OutputChunk { stream, bytes }).await.is_err() {
                        listening = false;
                    }
                } else {
                    trace!(port, ?stream, output = %String::from_utf8_lossy(&chunk[..n]), "server output");
                }
            }
        }
    }
}

fn append_bounded(buf: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_STARTUP_OUTPUT.saturating_sub(buf.len());
    buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
}
