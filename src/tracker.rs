//! Request tracker: correlates replies with in-flight calls.
//!
//! Every outgoing request registers a oneshot waiter keyed by its id. The
//! read loop completes the waiter when the matching reply arrives; a timeout
//! or connection teardown completes it instead. Whichever happens first
//! removes the entry, so each pending call resolves exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::protocol::ReplyOutcome;

/// Resolution of a pending call: reply payload, or the error to surface.
pub type CallOutcome = Result<Option<Vec<u8>>, ClientError>;

/// Tracks outstanding requests on one connection.
///
/// Ids are allocated from a monotonic counter and are unique for the
/// lifetime of the connection; a reconnect gets a fresh tracker and with it
/// a fresh id space.
pub struct RequestTracker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<CallOutcome>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a waiter for its reply.
    pub fn register(&self) -> (u64, oneshot::Receiver<CallOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        (id, rx)
    }

    /// Complete the waiter for `id` with a decoded reply outcome.
    ///
    /// An id with no waiter (already completed, timed out, or never issued)
    /// is a peer-side protocol violation; the reply is dropped with a
    /// warning and never reaches any caller.
    pub fn complete(&self, id: u64, outcome: ReplyOutcome) {
        let waiter = self.pending().remove(&id);
        let Some(tx) = waiter else {
            tracing::warn!(id, "dropping reply for unknown or completed request");
            return;
        };

        let result = match outcome {
            ReplyOutcome::Success { data } => Ok(data.map(|b| b.into_vec())),
            ReplyOutcome::Error { kind, message } => Err(ClientError::Remote { kind, message }),
        };

        if tx.send(result).is_err() {
            // Caller gave up between removal and delivery.
            tracing::debug!(id, "reply waiter dropped before delivery");
        }
    }

    /// Deregister a waiter whose caller stopped waiting (call timeout).
    /// A reply arriving later is then treated as unknown and dropped.
    pub fn discard(&self, id: u64) {
        self.pending().remove(&id);
    }

    /// Fail every still-pending call with `ConnectionClosed`.
    ///
    /// Removal and completion happen under one lock acquisition, so a reply
    /// racing with teardown can never complete a call a second time.
    pub fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending();
            pending.drain().collect()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending calls: connection closed");
        }

        for (_, tx) in drained {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}
