//! Correlation tables for in-flight requests.
//!
//! [`OutboundRequests`] tracks requests we sent and are waiting on;
//! [`InboundRequests`] tracks cancellable handler tasks for requests we received.
//! Both are owned by the protocol task and never shared.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::RpcError;
use crate::message::{MessageId, ResultSchemas};
use crate::registry::PayloadSchema;

/// Where the outcome of an outbound request is delivered.
pub type Reply = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Debug)]
struct PendingOutbound {
    method: String,
    reply: Reply,
    expected_result: Option<PayloadSchema>,
}

/// Requests sent to the peer that have not been answered yet.
#[derive(Debug, Default)]
pub struct OutboundRequests {
    pending: HashMap<MessageId, PendingOutbound>,
}

impl OutboundRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new request.
    ///
    /// # Errors
    ///
    /// Hands the reply back when `id` is already pending; the existing entry is untouched.
    pub fn register(
        &mut self,
        id: MessageId,
        method: impl Into<String>,
        reply: Reply,
        expected_result: Option<PayloadSchema>,
    ) -> Result<(), Reply> {
        if self.pending.contains_key(&id) {
            return Err(reply);
        }
        self.pending.insert(
            id,
            PendingOutbound {
                method: method.into(),
                reply,
                expected_result,
            },
        );
        Ok(())
    }

    /// Fulfil a pending request with its result. Returns `false` for unknown ids.
    pub fn resolve_response(&mut self, id: &MessageId, result: Value) -> bool {
        let Some(entry) = self.pending.remove(id) else {
            warn!("Received response to unknown message id \"{}\"", id);
            return false;
        };
        debug!("Received result for message \"{}\" ({})", id, entry.method);
        // The caller may have stopped waiting
        let _ = entry.reply.send(Ok(result));
        true
    }

    /// Fail a pending request. Returns `false` for unknown ids.
    pub fn resolve_error(&mut self, id: &MessageId, error: RpcError) -> bool {
        let Some(entry) = self.pending.remove(id) else {
            warn!("Received response to unknown message id \"{}\"", id);
            return false;
        };
        debug!(
            "Received error response to message \"{}\" ({}): {}",
            id, entry.method, error
        );
        let _ = entry.reply.send(Err(error));
        true
    }

    /// Fail every pending request with `RequestCancelled`.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (id, entry) in self.pending.drain() {
            let _ = entry.reply.send(Err(RpcError::request_cancelled(&id)));
        }
        count
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl ResultSchemas for OutboundRequests {
    fn take_result_schema(&mut self, id: &MessageId) -> Option<PayloadSchema> {
        self.pending
            .get_mut(id)
            .and_then(|entry| entry.expected_result.take())
    }
}

/// What a cancel request found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The task was still running and has been aborted.
    Aborted,
    /// The task already ended; its completion is on the way.
    AlreadyFinished,
    /// Nothing is registered under the id.
    Unknown,
}

/// Running async request handlers that the peer may cancel.
///
/// Each registration gets a generation token so that a completion only removes
/// the entry it was registered under, even if the peer reuses an id.
#[derive(Debug, Default)]
pub struct InboundRequests {
    next_token: u64,
    running: HashMap<MessageId, (u64, AbortHandle)>,
}

impl InboundRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a running handler task and return its token.
    pub fn register(&mut self, id: MessageId, handle: AbortHandle) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        if self.running.insert(id.clone(), (token, handle)).is_some() {
            warn!("Request id \"{}\" reused while still running", id);
        }
        token
    }

    /// Abort the task for `id`.
    ///
    /// A task that already ended keeps its entry so its completion removes it.
    pub fn cancel(&mut self, id: &MessageId) -> Cancellation {
        match self.running.get(id) {
            None => Cancellation::Unknown,
            Some((_, handle)) if handle.is_finished() => Cancellation::AlreadyFinished,
            Some(_) => {
                if let Some((_, handle)) = self.running.remove(id) {
                    handle.abort();
                }
                Cancellation::Aborted
            }
        }
    }

    /// Remove the entry for a completed task, if it is still the registered one.
    pub fn finish(&mut self, id: &MessageId, token: u64) -> bool {
        match self.running.get(id) {
            Some((current, _)) if *current == token => {
                self.running.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Abort every running task.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.running.len();
        for (_, (_, handle)) in self.running.drain() {
            handle.abort();
        }
        count
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.running.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}
