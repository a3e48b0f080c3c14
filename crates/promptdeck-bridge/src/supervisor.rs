//! Worker process supervision and the bridge event loop.
//!
//! Flow:
//! 1. Spawn the worker subprocess (stdin/stdout piped, stderr drained to logs)
//! 2. Wait for the `ready` sentinel, bounded by the startup timeout
//! 3. Run the event loop: route responses by id, publish events, fire deadlines
//! 4. On worker exit or transport error: fail every outstanding call at once
//!
//! The event loop task is the sole reader of worker stdout, the sole writer
//! of worker stdin, and the only writer of [`BridgeState`]. It never restarts
//! the worker on its own; after `Failed`, restart is a caller-driven
//! [`Bridge::start`](crate::Bridge::start).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::JsonLineCodec;
use crate::error::BridgeError;
use crate::mux::{Multiplexer, Reply};
use crate::protocol::{Message, Notification};

pub(crate) const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of the bridge. Written only by the bridge task; everyone
/// else observes it through a `watch` channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    #[default]
    NotStarted,
    /// Worker spawned, waiting for the `ready` sentinel.
    Starting,
    /// Accepting calls.
    Ready,
    /// Worker crashed or the transport broke; calls are refused until an
    /// explicit restart.
    Failed,
    /// `stop()` in progress: stdin closed, waiting for voluntary exit.
    ShuttingDown,
    Stopped,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::NotStarted => "not_started",
            BridgeState::Starting => "starting",
            BridgeState::Ready => "ready",
            BridgeState::Failed => "failed",
            BridgeState::ShuttingDown => "shutting_down",
            BridgeState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BridgeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different worker launch strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError>;
}

/// Default spawner: runs the configured program with stdin/stdout/stderr piped.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, SpawnError> {
        let mut command = ProcessCommand::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &config.env {
            command.env(key, value);
        }
        Ok(command.spawn()?)
    }
}

/// Worker launch and timing configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Inherited host environment plus these overrides. The default forces
    /// unbuffered worker output so partial lines flush promptly.
    pub env: Vec<(String, String)>,
    pub default_call_timeout: Duration,
    pub startup_timeout: Duration,
    /// How long `stop()` waits for voluntary exit before force-terminating.
    pub shutdown_grace: Duration,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl WorkerConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            default_call_timeout: DEFAULT_CALL_TIMEOUT,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner: Arc::new(CommandSpawner),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_default_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

/// Commands from facade handles to the bridge task.
pub(crate) enum Command {
    Call {
        method: String,
        params: serde_json::Value,
        timeout: Duration,
        reply: Reply,
    },
    Subscribe {
        key: String,
        sender: mpsc::UnboundedSender<serde_json::Value>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Drain worker stderr into the log sink. Diagnostics only, never protocol.
pub(crate) async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    tracing::info!(target: "promptdeck_bridge::worker", "{trimmed}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read worker stderr");
                break;
            }
        }
    }
}

async fn wait_child(child: &mut Option<Child>) -> String {
    match child {
        Some(child) => match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => format!("wait failed: {e}"),
        },
        None => std::future::pending().await,
    }
}

/// The bridge task: startup handshake, then the multiplexing event loop.
///
/// Sole owner of the framed reader/writer and the outstanding table.
pub(crate) async fn run_bridge<R, W>(
    reader: R,
    writer: W,
    mut child: Option<Child>,
    mut cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<BridgeState>,
    ready_tx: oneshot::Sender<Result<(), BridgeError>>,
    startup_timeout: Duration,
    shutdown_grace: Duration,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = FramedRead::new(reader, JsonLineCodec::<Message>::new());
    let mut writer = FramedWrite::new(writer, JsonLineCodec::<Message>::new());

    let _ = state_tx.send(BridgeState::Starting);

    let startup = tokio::time::timeout(
        startup_timeout,
        wait_for_ready(&mut reader, &mut child),
    )
    .await
    .unwrap_or(Err(BridgeError::StartupTimeout(startup_timeout)));

    if let Err(e) = startup {
        tracing::error!(error = %e, "Worker failed to start");
        let _ = state_tx.send(BridgeState::Failed);
        let _ = ready_tx.send(Err(e));
        return;
    }

    tracing::info!("Worker ready");
    let _ = state_tx.send(BridgeState::Ready);
    let _ = ready_tx.send(Ok(()));

    let mut mux = Multiplexer::new();

    loop {
        tokio::select! {
            biased;

            frame = reader.next() => match frame {
                Some(Ok(Message::Response(response))) => mux.resolve(response),
                Some(Ok(Message::Notification(Notification::Event { data }))) => mux.publish(data),
                Some(Ok(Message::Notification(Notification::Ready))) => {
                    tracing::warn!("Unexpected ready sentinel after startup");
                }
                Some(Ok(Message::Request(request))) => {
                    tracing::warn!(id = request.id, method = %request.method,
                        "Dropping unexpected request frame from worker");
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Worker transport error");
                    fail(&mut mux, &state_tx);
                    break;
                }
                None => {
                    tracing::warn!("Worker closed its output stream");
                    fail(&mut mux, &state_tx);
                    break;
                }
            },

            status = wait_child(&mut child), if child.is_some() => {
                tracing::error!(%status, "Worker process exited");
                child = None;
                fail(&mut mux, &state_tx);
                break;
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Call { method, params, timeout, reply }) => {
                    let request = mux.register(method, params, timeout, reply);
                    let id = request.id;
                    if let Err(e) = writer.send(Message::Request(request)).await {
                        // A broken pipe is a process-level fault, not a
                        // single-call failure: the just-registered entry is
                        // swept along with everything else.
                        tracing::error!(error = %e, "Failed to write request to worker");
                        fail(&mut mux, &state_tx);
                        break;
                    }
                    tracing::trace!(id, "Request written");
                }
                Some(Command::Subscribe { key, sender }) => mux.subscribe(key, sender),
                Some(Command::Shutdown { done }) => {
                    shutdown(writer, child, &mut mux, &state_tx, shutdown_grace).await;
                    let _ = done.send(());
                    return;
                }
                None => {
                    // Every facade handle is gone; wind the worker down.
                    tracing::debug!("All bridge handles dropped, shutting down worker");
                    shutdown(writer, child, &mut mux, &state_tx, shutdown_grace).await;
                    return;
                }
            },

            Some(id) = mux.next_deadline(), if mux.has_deadlines() => mux.expire(id),
        }
    }

    tracing::info!("Bridge event loop exiting");
}

async fn wait_for_ready<R>(
    reader: &mut FramedRead<R, JsonLineCodec<Message>>,
    child: &mut Option<Child>,
) -> Result<(), BridgeError>
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Notification(Notification::Ready))) => return Ok(()),
                Some(Ok(other)) => {
                    tracing::debug!(?other, "Skipping frame received before ready sentinel");
                }
                Some(Err(e)) => {
                    return Err(BridgeError::Startup(format!("transport error: {e}")));
                }
                None => {
                    return Err(BridgeError::Startup(
                        "worker closed its output before signalling ready".to_string(),
                    ));
                }
            },

            status = wait_child(child), if child.is_some() => {
                *child = None;
                return Err(BridgeError::Startup(format!(
                    "worker exited during startup: {status}"
                )));
            }
        }
    }
}

fn fail(mux: &mut Multiplexer, state_tx: &watch::Sender<BridgeState>) {
    mux.sweep();
    let _ = state_tx.send(BridgeState::Failed);
}

async fn shutdown<W>(
    writer: FramedWrite<W, JsonLineCodec<Message>>,
    mut child: Option<Child>,
    mux: &mut Multiplexer,
    state_tx: &watch::Sender<BridgeState>,
    grace: Duration,
) where
    W: AsyncWrite + Unpin,
{
    let _ = state_tx.send(BridgeState::ShuttingDown);

    // Closing the worker's input signals "no more work".
    drop(writer);

    if let Some(child) = child.as_mut() {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "Worker exited voluntarily");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed waiting for worker exit");
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not exit within grace period, killing"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill worker");
                }
            }
        }
    }

    // Anything still outstanding at force-termination fails exactly as in
    // the crash sweep.
    mux.sweep();
    let _ = state_tx.send(BridgeState::Stopped);
}
