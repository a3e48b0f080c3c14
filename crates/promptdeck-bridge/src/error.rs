//! Error taxonomy surfaced to bridge callers.

use std::time::Duration;

use crate::supervisor::{BridgeState, SpawnError};

/// Everything a caller of the bridge can observe going wrong.
///
/// Transport decode failures and responses with unknown ids are recovered
/// inside the event loop (logged and dropped) and never appear here. Every
/// call path is timeout-bounded: a caller gets exactly one of a matching
/// response, a timeout, or a process-failure sweep.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("worker startup failed: {0}")]
    Startup(String),

    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// The bridge refuses calls unless it is `Ready`; no write is attempted.
    #[error("bridge is not ready (state: {0})")]
    NotReady(BridgeState),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The worker answered `success: false`; its message passes through verbatim.
    #[error("worker error: {0}")]
    Worker(String),

    /// The worker terminated while this call was outstanding.
    #[error("worker unavailable")]
    WorkerUnavailable,

    /// The bridge task is gone (stopped, or its handle chain was dropped).
    #[error("bridge task terminated")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}
