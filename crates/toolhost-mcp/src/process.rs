//! Child-process plumbing for spawned servers: launch, output pumps,
//! readiness detection, supervision and process-tree shutdown.

use crate::error::McpError;
use crate::jsonrpc::is_jsonrpc_line;
use crate::transport::StdioTransport;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use toolhost_config::ServerDefinition;

#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Output lines that mark a server as ready, compared case-insensitively.
///
/// A line that is just "ready" (trailing punctuation allowed) also counts.
pub const BUILTIN_READY_PHRASES: &[&str] =
    &["running on stdio", "server running", "server started", "server ready"];

const BARE_READY: &str = "ready";

/// Time a server gets between SIGTERM and SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Request to the supervisor: stop the process, then ack.
pub(crate) type StopRequest = oneshot::Sender<()>;

/// Watches output lines for a readiness phrase.
pub(crate) struct Readiness {
    phrases: Vec<String>,
    bare_ready: bool,
    seen: AtomicBool,
    notify: Notify,
}

impl Readiness {
    pub(crate) fn new(ready_phrase: Option<&str>) -> Self {
        let (phrases, bare_ready) = match ready_phrase {
            Some(phrase) => (vec![phrase.to_lowercase()], false),
            None => (BUILTIN_READY_PHRASES.iter().map(|p| p.to_string()).collect(), true),
        };
        Self {
            phrases,
            bare_ready,
            seen: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn matches(&self, line: &str) -> bool {
        let line = line.to_lowercase();
        if self.phrases.iter().any(|p| line.contains(p.as_str())) {
            return true;
        }
        self.bare_ready
            && line
                .trim()
                .trim_end_matches(|c: char| c.is_ascii_punctuation())
                == BARE_READY
    }

    fn check(&self, line: &str) {
        if self.seen.load(Ordering::Acquire) || !self.matches(line) {
            return;
        }
        if !self.seen.swap(true, Ordering::AcqRel) {
            // A stored permit wakes the waiter even if it is not parked yet.
            self.notify.notify_one();
        }
    }

    pub(crate) async fn wait(&self) {
        if self.seen.load(Ordering::Acquire) {
            return;
        }
        self.notify.notified().await;
    }
}

/// How a child process ended.
#[derive(Debug, Clone)]
pub(crate) struct ExitInfo {
    pub code: Option<i32>,
    pub status: String,
    /// True when the exit followed a stop request.
    pub requested: bool,
}

impl ExitInfo {
    fn new(status: io::Result<ExitStatus>, requested: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                status: status.to_string(),
                requested,
            },
            Err(e) => Self {
                code: None,
                status: format!("unknown exit status: {e}"),
                requested,
            },
        }
    }
}

/// A launched server process. Dropping `stop_tx` also stops the process.
pub(crate) struct SpawnedProcess {
    pub pid: Option<u32>,
    pub transport: Arc<StdioTransport>,
    pub readiness: Arc<Readiness>,
    pub exit_rx: watch::Receiver<Option<ExitInfo>>,
    pub stop_tx: oneshot::Sender<StopRequest>,
}

impl SpawnedProcess {
    /// Ask the supervisor to terminate the process tree and wait for it.
    pub(crate) async fn terminate(stop_tx: oneshot::Sender<StopRequest>) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Launch the server's command with piped stdio and start its background
/// tasks: two output pumps and a supervisor owning the child.
pub(crate) fn spawn(name: &str, definition: &ServerDefinition) -> Result<SpawnedProcess, McpError> {
    let mut cmd = Command::new(&definition.command);
    cmd.args(&definition.args)
        .envs(&definition.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &definition.cwd {
        cmd.current_dir(cwd);
    }
    // Own process group so the whole tree can be signalled.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| McpError::SpawnFailed {
        name: name.to_string(),
        source,
    })?;
    let pid = child.id();
    tracing::info!(server = name, pid, command = %definition.command, "spawned server process");

    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

    let (line_tx, line_rx) = mpsc::channel::<String>(64);
    let transport = Arc::new(StdioTransport::new(name, stdin, line_rx));
    let readiness = Arc::new(Readiness::new(definition.ready_phrase.as_deref()));

    tokio::spawn(pump(
        name.to_string(),
        "stdout",
        stdout,
        Some(line_tx),
        Arc::clone(&readiness),
    ));
    tokio::spawn(pump(
        name.to_string(),
        "stderr",
        stderr,
        None,
        Arc::clone(&readiness),
    ));

    let (stop_tx, stop_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);
    tokio::spawn(supervise(name.to_string(), child, stop_rx, exit_tx));

    Ok(SpawnedProcess {
        pid,
        transport,
        readiness,
        exit_rx,
        stop_tx,
    })
}

fn missing_pipe(stream: &str) -> McpError {
    McpError::Io(io::Error::other(format!("child {stream} was not piped")))
}

/// Drain one output stream for the life of the process. JSON-RPC lines go to
/// the transport; everything else is logged and checked for readiness.
async fn pump<R>(
    server: String,
    stream: &'static str,
    reader: R,
    mut messages: Option<mpsc::Sender<String>>,
    readiness: Arc<Readiness>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %server, stream, "output read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(tx) = &messages {
            if is_jsonrpc_line(&line) {
                if tx.send(line).await.is_err() {
                    // Transport is gone; keep draining so the pipe never fills.
                    messages = None;
                }
                continue;
            }
        }
        tracing::info!(target: "toolhost::server", server = %server, stream, "{line}");
        readiness.check(&line);
    }
    tracing::debug!(server = %server, stream, "output stream closed");
}

enum Wake {
    Exited(io::Result<ExitStatus>),
    Stop(Option<StopRequest>),
}

/// Own the child until it exits or a stop is requested; publish how it ended.
async fn supervise(
    server: String,
    mut child: Child,
    stop_rx: oneshot::Receiver<StopRequest>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        request = stop_rx => Wake::Stop(request.ok()),
    };

    match wake {
        Wake::Exited(status) => {
            let info = ExitInfo::new(status, false);
            tracing::debug!(server = %server, status = %info.status, "server process exited");
            exit_tx.send_replace(Some(info));
        }
        Wake::Stop(ack) => {
            let status = shutdown_child(&mut child).await;
            let info = ExitInfo::new(status, true);
            tracing::debug!(server = %server, status = %info.status, "server process stopped");
            exit_tx.send_replace(Some(info));
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
        }
    }
}

/// Terminate the child's process group: SIGTERM, a grace period, then SIGKILL.
#[cfg(unix)]
async fn shutdown_child(child: &mut Child) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(e) = signal::killpg(group, Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        tracing::debug!(pid, "SIGTERM to process group failed: {e}");
    }

    if let Ok(status) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
        return status;
    }

    tracing::warn!(pid, "server ignored SIGTERM; sending SIGKILL");
    let _ = signal::killpg(group, Signal::SIGKILL);
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(not(unix))]
async fn shutdown_child(child: &mut Child) -> io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}
