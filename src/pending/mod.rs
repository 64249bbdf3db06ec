//! In-flight request table keyed by correlation id.
//!
//! Each entry owns a single-use channel back to its waiter and a deadline
//! timer. Whatever settles an entry first (reply, rejection, deadline,
//! eviction, shutdown) removes it; every later settlement finds nothing and
//! does nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};

/// Outcome delivered to a waiting call.
pub type Outcome = Result<Envelope>;

struct Entry {
    sender: oneshot::Sender<Outcome>,
    reply_topic: String,
    seq: u64,
    timer: AbortHandle,
}

impl Entry {
    fn settle(self, outcome: Outcome) {
        self.timer.abort();
        // The waiter may already be gone (dropped call future).
        let _ = self.sender.send(outcome);
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    closed: bool,
}

/// Process-wide pending request table.
///
/// Share it behind an `Arc`; deadline timers hold only a weak reference.
#[derive(Default)]
pub struct PendingTable {
    state: Mutex<State>,
    next_seq: AtomicU64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`, rejecting it with `Timeout` after `timeout`.
    ///
    /// An existing entry under the same id is replaced; its waiter is rejected
    /// with a protocol error.
    pub fn register(
        self: &Arc<Self>,
        id: &str,
        reply_topic: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>> {
        let (receiver, replaced) = self.insert(id, reply_topic, timeout, true)?;
        if let Some(previous) = replaced {
            debug!(correlation_id = %id, "Pending entry replaced");
            previous.settle(Err(BridgeError::Protocol(format!(
                "correlation id '{}' was registered again",
                id
            ))));
        }
        Ok(receiver)
    }

    /// Like `register`, but fails with a protocol error if `id` is already waiting.
    pub fn register_exclusive(
        self: &Arc<Self>,
        id: &str,
        reply_topic: &str,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Outcome>> {
        self.insert(id, reply_topic, timeout, false)
            .map(|(receiver, _)| receiver)
    }

    fn insert(
        self: &Arc<Self>,
        id: &str,
        reply_topic: &str,
        timeout: Duration,
        replace: bool,
    ) -> Result<(oneshot::Receiver<Outcome>, Option<Entry>)> {
        let (sender, receiver) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if state.closed {
            return Err(BridgeError::Shutdown);
        }
        if !replace && state.entries.contains_key(id) {
            return Err(BridgeError::Protocol(format!(
                "correlation id '{}' is already in flight",
                id
            )));
        }

        // Spawned under the lock so a zero timeout cannot fire before the insert.
        let timer = self.spawn_deadline(id, seq, timeout);
        let replaced = state.entries.insert(
            id.to_string(),
            Entry {
                sender,
                reply_topic: reply_topic.to_string(),
                seq,
                timer,
            },
        );
        Ok((receiver, replaced))
    }

    fn spawn_deadline(self: &Arc<Self>, id: &str, seq: u64, timeout: Duration) -> AbortHandle {
        let table: Weak<Self> = Arc::downgrade(self);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = table.upgrade() {
                table.expire(&id, seq, timeout);
            }
        })
        .abort_handle()
    }

    fn expire(&self, id: &str, seq: u64, timeout: Duration) {
        let entry = {
            let mut state = self.state.lock();
            match state.entries.get(id) {
                Some(entry) if entry.seq == seq => state.entries.remove(id),
                _ => None,
            }
        };

        if let Some(entry) = entry {
            debug!(correlation_id = %id, timeout = ?timeout, "Pending request timed out");
            let reply_topic = entry.reply_topic.clone();
            entry.settle(Err(BridgeError::Timeout {
                reply_topic,
                correlation_id: id.to_string(),
                timeout,
            }));
        }
    }

    fn take(&self, id: &str) -> Option<Entry> {
        self.state.lock().entries.remove(id)
    }

    /// Resolve `id` with `reply`. Returns false if nothing was waiting.
    pub fn settle_resolve(&self, id: &str, reply: Envelope) -> bool {
        self.settle(id, Ok(reply))
    }

    /// Reject `id` with `error`. Returns false if nothing was waiting.
    pub fn settle_reject(&self, id: &str, error: BridgeError) -> bool {
        self.settle(id, Err(error))
    }

    pub fn settle(&self, id: &str, outcome: Outcome) -> bool {
        match self.take(id) {
            Some(entry) => {
                entry.settle(outcome);
                true
            }
            None => false,
        }
    }

    /// Settle `id` only if it is waiting on `reply_topic`.
    pub fn settle_from(&self, reply_topic: &str, id: &str, outcome: Outcome) -> bool {
        let entry = {
            let mut state = self.state.lock();
            match state.entries.get(id) {
                Some(entry) if entry.reply_topic == reply_topic => state.entries.remove(id),
                _ => None,
            }
        };

        match entry {
            Some(entry) => {
                entry.settle(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without notifying its waiter.
    pub fn evict(&self, id: &str) -> bool {
        match self.take(id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().closed
    }

    /// Reject every pending entry with `Shutdown` and refuse new ones.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for entry in drained {
            entry.settle(Err(BridgeError::Shutdown));
        }
        if count > 0 {
            debug!(count, "Rejected pending requests on shutdown");
        }
        count
    }
}
