//! Request multiplexer - correlation ids, deadlines, and event fan-out.
//!
//! The `Multiplexer` is owned exclusively by the bridge event loop task;
//! callers never touch it directly. That single-writer discipline is what
//! keeps the outstanding table free of locks.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;

use crate::error::BridgeError;
use crate::protocol::{Request, Response};

/// Completion handed back to the caller: exactly one of a matching response,
/// a timeout, or a process-failure sweep resolves it.
pub(crate) type Reply = oneshot::Sender<Result<Value, BridgeError>>;

struct Pending {
    reply: Reply,
    deadline: Key,
    timeout: Duration,
    sent_at: Instant,
}

pub(crate) struct Multiplexer {
    next_id: u64,
    pending: HashMap<u64, Pending>,
    deadlines: DelayQueue<u64>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Value>>,
}

impl Multiplexer {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            deadlines: DelayQueue::new(),
            subscribers: HashMap::new(),
        }
    }

    /// Allocate a fresh id and register the completion with its deadline.
    /// The returned `Request` still has to be written by the event loop.
    pub(crate) fn register(
        &mut self,
        method: String,
        params: Value,
        timeout: Duration,
        reply: Reply,
    ) -> Request {
        let id = self.next_id;
        self.next_id += 1;

        let deadline = self.deadlines.insert(id, timeout);
        self.pending.insert(
            id,
            Pending {
                reply,
                deadline,
                timeout,
                sent_at: Instant::now(),
            },
        );

        Request { id, method, params }
    }

    /// Match a response against the outstanding table.
    ///
    /// An unknown id is not an error: the entry may already have timed out,
    /// and late answers are expected and harmless.
    pub(crate) fn resolve(&mut self, response: Response) {
        let Some(entry) = self.pending.remove(&response.id) else {
            tracing::debug!(id = response.id, "Discarding response with no outstanding request");
            return;
        };
        let _ = self.deadlines.try_remove(&entry.deadline);

        tracing::trace!(
            id = response.id,
            success = response.success,
            elapsed_ms = entry.sent_at.elapsed().as_millis() as u64,
            "Response matched"
        );

        let result = response.into_result().map_err(BridgeError::Worker);
        if entry.reply.send(result).is_err() {
            tracing::debug!("Caller abandoned call before its response arrived");
        }
    }

    /// Deadline fired before a matching response arrived.
    pub(crate) fn expire(&mut self, id: u64) {
        // The entry may already be resolved if its response raced the expiry.
        if let Some(entry) = self.pending.remove(&id) {
            tracing::debug!(id, timeout_ms = entry.timeout.as_millis() as u64, "Call timed out");
            let _ = entry.reply.send(Err(BridgeError::Timeout(entry.timeout)));
        }
    }

    /// Publish an event to every current subscriber, each receiving its own
    /// ordered copy. Subscribers whose receiver is gone are pruned.
    pub(crate) fn publish(&mut self, data: Value) {
        self.subscribers
            .retain(|key, sender| match sender.send(data.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(key = %key, "Dropping closed event subscriber");
                    false
                }
            });
    }

    /// Register an event subscriber under a name. Re-registering the same
    /// name replaces the previous subscriber, so a reinitialized component
    /// never leaves a stale handler fanning out behind it.
    pub(crate) fn subscribe(&mut self, key: String, sender: mpsc::UnboundedSender<Value>) {
        if self.subscribers.insert(key.clone(), sender).is_some() {
            tracing::debug!(key = %key, "Replaced existing event subscriber");
        }
    }

    /// Mass-failure sweep: the worker is gone, so every outstanding call
    /// fails at once and the table ends up empty.
    pub(crate) fn sweep(&mut self) {
        let failed = self.pending.len();
        if failed > 0 {
            tracing::warn!(failed, "Failing all outstanding calls: worker terminated");
        }
        for (_, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(BridgeError::WorkerUnavailable));
        }
        self.deadlines.clear();
    }

    /// Next expired deadline, if any. Must be guarded with
    /// [`has_deadlines`](Self::has_deadlines) in a `select!` arm: an empty
    /// queue reports exhaustion rather than pending.
    pub(crate) async fn next_deadline(&mut self) -> Option<u64> {
        self.deadlines.next().await.map(|expired| expired.into_inner())
    }

    pub(crate) fn has_deadlines(&self) -> bool {
        !self.deadlines.is_empty()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
