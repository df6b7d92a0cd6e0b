//! Child process supervision.
//!
//! [`ProcessSupervisor::spawn`] launches a registered program and returns a
//! [`SupervisedProcess`] whose event channel carries, in order:
//! - raw stdout / stderr chunks as they are read (each stream keeps its own
//!   order, the two are interleaved as they arrive)
//! - exactly one [`ProcessEvent::Exited`], sent after both output streams
//!   reached EOF and every chunk was forwarded
//!
//! Each child leads its own process group. An optional wall-clock limit, or
//! [`ProcessSupervisor::shutdown`], terminates the whole group with SIGTERM,
//! then SIGKILL once the grace period expires. After a termination the
//! output readers get one more grace period to drain; with a limit set, a
//! normally exited child's readers are bounded by what is left of it.
//! Descendants holding the pipes past that are killed and their output
//! abandoned, so they cannot delay the exit event.

use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::decode::Utf8Decoder;
use crate::registry::Invocation;

/// Size of a single pipe read.
pub const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Default capacity of the per-process event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// How a supervised child ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exit status observed; `code` is `None` when killed by a signal.
    Exited { code: Option<i32> },
    /// Waiting on the child failed.
    WaitFailed(String),
    /// The wall-clock limit expired and the child was terminated.
    TimedOut { after: Duration },
    /// The supervisor was shut down while the child was running.
    Interrupted,
}

impl ExitOutcome {
    pub const fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0) })
    }

    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            Self::WaitFailed(_) | Self::TimedOut { .. } | Self::Interrupted => None,
        }
    }

    /// Human-readable failure reason, `None` on success.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Exited { code: Some(0) } => None,
            Self::Exited { code: Some(code) } => Some(format!("Exited with code {code}")),
            Self::Exited { code: None } => Some("Terminated by signal".to_string()),
            Self::WaitFailed(reason) => Some(format!("Process error: {reason}")),
            Self::TimedOut { after } => Some(format!("Timed out after {after:?}")),
            Self::Interrupted => Some("Interrupted by shutdown".to_string()),
        }
    }
}

/// One observation from a supervised child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    Exited(ExitOutcome),
}

/// Errors launching a child.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to spawn {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to capture {stream} of {program}")]
    MissingPipe {
        program: String,
        stream: &'static str,
    },
}

/// Spawns children and supervises them until exit.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    timeout: Option<Duration>,
    terminate_grace: Duration,
    event_capacity: usize,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self {
            timeout: None,
            terminate_grace: Duration::from_secs(5),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            shutdown: Arc::new(watch::channel(false).0),
        }
    }
}

impl ProcessSupervisor {
    pub fn new(timeout: Option<Duration>, terminate_grace: Duration) -> Self {
        Self {
            timeout,
            terminate_grace,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Terminate every child of this supervisor (and its clones), present
    /// and future. Their exit events report [`ExitOutcome::Interrupted`].
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Supervisor shutting down, terminating running jobs");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Launch `invocation.program` with `args`.
    ///
    /// Must be called from within a tokio runtime: the reader and waiter
    /// tasks are spawned onto it.
    pub fn spawn(
        &self,
        invocation: &Invocation,
        args: &[String],
    ) -> Result<SupervisedProcess, SpawnError> {
        let program = invocation.program.display().to_string();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &invocation.working_directory {
            cmd.current_dir(dir);
        }

        info!(program = %program, ?args, "Spawning job process");
        let mut child = cmd.spawn().map_err(|source| SpawnError::Launch {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingPipe {
            program: program.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SpawnError::MissingPipe {
            program: program.clone(),
            stream: "stderr",
        })?;

        let (tx, rx) = mpsc::channel(self.event_capacity);

        let stdout_task = tokio::spawn(forward_output(
            stdout,
            tx.clone(),
            ProcessEvent::Stdout,
            "stdout",
        ));
        let stderr_task = tokio::spawn(forward_output(
            stderr,
            tx.clone(),
            ProcessEvent::Stderr,
            "stderr",
        ));

        tokio::spawn(wait_for_exit(
            child,
            [stdout_task, stderr_task],
            tx,
            Limits {
                timeout: self.timeout,
                grace: self.terminate_grace,
                shutdown: self.shutdown.subscribe(),
            },
        ));

        Ok(SupervisedProcess { pid, events: rx })
    }
}

/// A running child and its ordered event channel.
#[derive(Debug)]
pub struct SupervisedProcess {
    pid: Option<u32>,
    events: mpsc::Receiver<ProcessEvent>,
}

impl SupervisedProcess {
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next event; `None` once the supervisor is gone. After
    /// [`ProcessEvent::Exited`] the channel always ends.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }
}

/// Forward one pipe's output as decoded chunks until EOF.
///
/// Keeps draining after the receiver is gone so the child never blocks on
/// a full pipe.
async fn forward_output<R>(
    mut reader: R,
    tx: mpsc::Sender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
    stream: &'static str,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut decoder = Utf8Decoder::new();
    let mut receiver_gone = false;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(stream, error = %e, "Failed to read child output");
                break;
            }
        };
        let text = decoder.decode(&buf[..n]);
        if text.is_empty() || receiver_gone {
            continue;
        }
        debug!(stream, bytes = n, "Child output chunk");
        if tx.send(wrap(text)).await.is_err() {
            receiver_gone = true;
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() && !receiver_gone {
        let _ = tx.send(wrap(tail)).await;
    }
    debug!(stream, "Output reader finished");
}

struct Limits {
    timeout: Option<Duration>,
    grace: Duration,
    shutdown: watch::Receiver<bool>,
}

enum Stop {
    Exited(io::Result<std::process::ExitStatus>),
    TimedOut(Duration),
    Shutdown,
}

/// Wait for the child (bounded by the timeout and shutdown), then for both
/// readers, then emit the single terminal event.
async fn wait_for_exit(
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    tx: mpsc::Sender<ProcessEvent>,
    limits: Limits,
) {
    let Limits {
        timeout,
        grace,
        shutdown,
    } = limits;

    let pgid = child.id();
    let deadline_at = timeout.map(|limit| tokio::time::Instant::now() + limit);
    let deadline = async {
        match (timeout, deadline_at) {
            (Some(limit), Some(at)) => {
                tokio::time::sleep_until(at).await;
                limit
            }
            _ => std::future::pending().await,
        }
    };

    let stop = tokio::select! {
        result = child.wait() => Stop::Exited(result),
        limit = deadline => Stop::TimedOut(limit),
        () = shutdown_requested(shutdown) => Stop::Shutdown,
    };

    let (outcome, reader_bound) = match stop {
        // A configured limit also bounds descendants that keep the pipes open.
        Stop::Exited(result) => (
            observe(result),
            deadline_at.map(|at| at.saturating_duration_since(tokio::time::Instant::now())),
        ),
        Stop::TimedOut(limit) => {
            warn!(pid = ?child.id(), timeout = ?limit, "Job timed out, sending SIGTERM");
            terminate_process(&mut child, grace).await;
            (ExitOutcome::TimedOut { after: limit }, Some(grace))
        }
        Stop::Shutdown => {
            warn!(pid = ?child.id(), "Shutdown requested, sending SIGTERM");
            terminate_process(&mut child, grace).await;
            (ExitOutcome::Interrupted, Some(grace))
        }
    };

    for mut reader in readers {
        let joined = match reader_bound {
            None => (&mut reader).await,
            Some(bound) => match tokio::time::timeout(bound, &mut reader).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(pgid = ?pgid, "Output pipe still held open, killing process group");
                    signal_group(pgid, Signal::Kill);
                    reader.abort();
                    continue;
                }
            },
        };
        if let Err(e) = joined {
            warn!(error = %e, "Output reader task failed");
        }
    }

    debug!(?outcome, "Job process finished");
    let _ = tx.send(ProcessEvent::Exited(outcome)).await;
}

/// Resolves once shutdown is requested; never if the supervisor is dropped
/// without requesting it.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn observe(result: io::Result<std::process::ExitStatus>) -> ExitOutcome {
    match result {
        Ok(status) => ExitOutcome::Exited {
            code: status.code(),
        },
        Err(e) => ExitOutcome::WaitFailed(e.to_string()),
    }
}

/// Terminate a child's process group: SIGTERM, wait grace period, then
/// SIGKILL for whatever is left.
async fn terminate_process(child: &mut Child, grace: Duration) {
    let pgid = child.id();
    signal_group(pgid, Signal::Term);

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!("Grace period expired, sending SIGKILL");
        let _ = child.kill().await;
    }
    // Descendants that ignored SIGTERM or outlived the leader.
    signal_group(pgid, Signal::Kill);
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: Signal) {
    let Some(pgid) = pgid else {
        return;
    };
    let signo = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: pgid is our own child's pid, which leads its process group.
    #[allow(unsafe_code, clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(-(pgid as i32), signo) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, ?signal, error = %err, "Failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: Signal) {}
