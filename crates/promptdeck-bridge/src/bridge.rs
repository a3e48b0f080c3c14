//! Public facade over the bridge event loop.
//!
//! `Bridge` is a cheap, cloneable handle: named operations and the generic
//! [`call`](Bridge::call) all submit through the same command channel to the
//! single event-loop task. The facade performs no business validation; it is
//! a naming and typing convenience over the multiplexer.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::BridgeError;
use crate::supervisor::{self, BridgeState, Command, WorkerConfig};

/// Handle to a running worker bridge.
///
/// Any number of callers may invoke [`call`](Bridge::call) concurrently; each
/// suspends only its own task until its completion resolves. After the worker
/// fails, the handle keeps rejecting calls with [`BridgeError::NotReady`]
/// until the host explicitly starts a fresh bridge — there is no silent
/// auto-restart.
#[derive(Clone, Debug)]
pub struct Bridge {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<BridgeState>,
    default_timeout: Duration,
}

impl Bridge {
    /// Launch the worker and wait for its ready sentinel.
    ///
    /// Returns once the bridge is `Ready`, or with a typed startup error if
    /// the worker fails to spawn, exits early, or misses the startup window.
    pub async fn start(config: WorkerConfig) -> Result<Self, BridgeError> {
        let spawner = config.spawner.clone();
        let mut child = spawner.spawn(&config)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Startup("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Startup("worker stdout not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(supervisor::forward_stderr(stderr));
        }

        Self::start_with_io(stdout, stdin, Some(child), &config).await
    }

    /// Wire the bridge over an arbitrary byte stream pair. Production goes
    /// through [`start`](Self::start); tests drive this with in-memory pipes.
    pub(crate) async fn start_with_io<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        config: &WorkerConfig,
    ) -> Result<Self, BridgeError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(BridgeState::NotStarted);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(supervisor::run_bridge(
            reader,
            writer,
            child,
            cmd_rx,
            state_tx,
            ready_tx,
            config.startup_timeout,
            config.shutdown_grace,
        ));

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                state_rx,
                default_timeout: config.default_call_timeout,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BridgeError::Closed),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state_rx.borrow()
    }

    /// Generic escape hatch: reach any worker-side operation by
    /// `namespace/action` name without adding a wrapper here.
    pub async fn call(
        &self,
        method: impl Into<String>,
        params: Value,
    ) -> Result<Value, BridgeError> {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: impl Into<String>,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        let state = self.state();
        if state != BridgeState::Ready {
            return Err(BridgeError::NotReady(state));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Call {
                method: method.into(),
                params,
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BridgeError::Closed)?;

        reply_rx.await.map_err(|_| BridgeError::Closed)?
    }

    /// Receive unsolicited worker events under a subscriber name. Subscribing
    /// again under the same name replaces the previous subscription.
    pub async fn subscribe(
        &self,
        key: impl Into<String>,
    ) -> Result<mpsc::UnboundedReceiver<Value>, BridgeError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(Command::Subscribe {
                key: key.into(),
                sender: tx,
            })
            .await
            .map_err(|_| BridgeError::Closed)?;
        Ok(rx)
    }

    /// Graceful shutdown: close the worker's input, wait the grace period for
    /// voluntary exit, force-terminate if needed. Idempotent once stopped.
    pub async fn stop(&self) -> Result<(), BridgeError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { done: done_tx })
            .await
            .is_err()
        {
            // The task is already gone; stopped is what the caller wanted.
            return Ok(());
        }
        done_rx.await.map_err(|_| BridgeError::Closed)
    }

    // Named wrappers over `call`. Thin by design: the worker owns semantics.

    pub async fn get_tree(&self) -> Result<Value, BridgeError> {
        self.call("project/get_tree", json!({})).await
    }

    pub async fn read_files(&self, paths: &[impl AsRef<str>]) -> Result<Value, BridgeError> {
        let paths: Vec<&str> = paths.iter().map(AsRef::as_ref).collect();
        self.call("project/read_files", json!({ "paths": paths }))
            .await
    }

    pub async fn count_tokens(&self, text: &str) -> Result<u64, BridgeError> {
        let result = self.call("token/count", json!({ "text": text })).await?;
        result
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                BridgeError::Protocol(format!("token/count returned unexpected shape: {result}"))
            })
    }

    pub async fn list_entities(&self, kind: &str) -> Result<Value, BridgeError> {
        self.call("entity/list", json!({ "kind": kind })).await
    }

    pub async fn create_entity(&self, kind: &str, data: Value) -> Result<Value, BridgeError> {
        self.call("entity/create", json!({ "kind": kind, "data": data }))
            .await
    }

    pub async fn update_entity(
        &self,
        kind: &str,
        id: &str,
        data: Value,
    ) -> Result<Value, BridgeError> {
        self.call("entity/update", json!({ "kind": kind, "id": id, "data": data }))
            .await
    }

    pub async fn delete_entity(&self, kind: &str, id: &str) -> Result<Value, BridgeError> {
        self.call("entity/delete", json!({ "kind": kind, "id": id }))
            .await
    }
}
