//! Caller side of the bridge.
//!
//! `RequestDispatcher::call` turns one publish plus one reply into an awaited
//! result:
//! 1. validate the correlation id (no broker I/O on failure)
//! 2. subscribe to `<topic>/<correlation id>`
//! 3. register the pending entry before publishing
//! 4. publish; a failed publish rejects the entry at once
//! 5. await reply, rejection or deadline
//! 6. unsubscribe from the reply topic, whatever happened
//!
//! A single listener task feeds replies from the connection's inbound stream
//! into the pending table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn, Span};

use crate::bus::InboundMessage;
use crate::config::DispatcherConfig;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::pending::{Outcome, PendingTable};
use crate::topics::reply_topic_for;

/// Default deadline for a call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

struct Inner {
    connection: Connection,
    pending: Arc<PendingTable>,
    default_timeout: Duration,
    listener: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Issues calls over the broker and correlates their replies.
///
/// Cloning shares the same listener and pending table.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl RequestDispatcher {
    pub fn new(connection: Connection, pending: Arc<PendingTable>, default_timeout: Duration) -> Self {
        // Subscribe before spawning so no reply published after `new` is missed.
        let messages = connection.messages();
        let listener = tokio::spawn(listen(messages, Arc::clone(&pending)));

        Self {
            inner: Arc::new(Inner {
                connection,
                pending,
                default_timeout,
                listener,
            }),
        }
    }

    pub fn from_config(connection: Connection, config: &DispatcherConfig) -> Self {
        Self::new(
            connection,
            Arc::new(PendingTable::new()),
            config.default_timeout(),
        )
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.inner.pending
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// `call` with the configured default deadline.
    pub async fn call_default(&self, topic: &str, payload: Envelope) -> Result<Envelope> {
        self.call(topic, payload, self.inner.default_timeout).await
    }

    /// Publish `payload` to `topic` and wait for the correlated reply.
    ///
    /// `payload` must carry a non-empty string `correlationId` that is not
    /// already in flight. Replies with a 5xx `status` and an `error.message`
    /// reject with `BridgeError::Remote`; every other reply resolves as-is.
    #[instrument(name = "dispatcher.call", skip_all, fields(topic = %topic, correlation_id = tracing::field::Empty))]
    pub async fn call(&self, topic: &str, payload: Envelope, timeout: Duration) -> Result<Envelope> {
        let id = payload.require_correlation_id()?.to_string();
        Span::current().record("correlation_id", id.as_str());

        let pending = &self.inner.pending;
        let connection = &self.inner.connection;

        if pending.is_shut_down() {
            return Err(BridgeError::Shutdown);
        }
        // Checked before subscribing: the reply topic belongs to the call in flight.
        if pending.contains(&id) {
            return Err(in_flight(&id));
        }

        let reply_topic = reply_topic_for(topic, &id);
        connection.subscribe(&reply_topic).await?;

        let receiver = match pending.register_exclusive(&id, &reply_topic, timeout) {
            Ok(receiver) => receiver,
            // Lost a race with a concurrent call using the same id; its subscription stays.
            Err(e @ BridgeError::Protocol(_)) => return Err(e),
            Err(e) => {
                connection.unsubscribe_quietly(&reply_topic).await;
                return Err(e);
            }
        };
        let cleanup = CallCleanup::new(connection.clone(), Arc::clone(pending), &id, &reply_topic);

        let request = payload.with_reply_topic(reply_topic.as_str());
        if let Err(e) = connection.publish(topic, &request).await {
            warn!(error = %e, "Request publish failed");
            pending.settle_reject(&id, e);
        } else {
            debug!(reply_topic = %reply_topic, "Request published");
        }

        let outcome = receiver.await.unwrap_or(Err(BridgeError::Shutdown));
        cleanup.finish().await;

        match &outcome {
            Ok(_) => debug!("Call resolved"),
            Err(e) if e.is_timeout() => warn!(timeout = ?timeout, "Call timed out"),
            Err(e) => debug!(error = %e, "Call rejected"),
        }
        outcome
    }

    /// Reject every in-flight call with `Shutdown` and stop listening.
    pub fn shutdown(&self) {
        let rejected = self.inner.pending.shutdown();
        self.inner.listener.abort();
        debug!(rejected, "Dispatcher shut down");
    }
}

fn in_flight(id: &str) -> BridgeError {
    BridgeError::Protocol(format!("correlation id '{}' is already in flight", id))
}

/// Reply classification: 5xx with an error message rejects.
fn reply_outcome(reply: Envelope) -> Outcome {
    match (reply.status(), reply.error_message()) {
        (Some(status), Some(message)) if status >= 500 => Err(BridgeError::Remote {
            status,
            message: message.to_string(),
        }),
        _ => Ok(reply),
    }
}

async fn listen(mut messages: broadcast::Receiver<InboundMessage>, pending: Arc<PendingTable>) {
    loop {
        match messages.recv().await {
            Ok(message) => handle_reply(&pending, message),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Reply listener lagged; replies may be lost");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn handle_reply(pending: &PendingTable, message: InboundMessage) {
    let envelope = match Envelope::from_slice(&message.topic, &message.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable inbound message");
            return;
        }
    };

    let Some(id) = envelope.correlation_id().map(str::to_string) else {
        debug!(topic = %message.topic, "Ignoring inbound message without correlation id");
        return;
    };

    if !pending.settle_from(&message.topic, &id, reply_outcome(envelope)) {
        // Requests to local workers and late replies both land here.
        debug!(topic = %message.topic, correlation_id = %id, "No pending call for message");
    }
}

/// Reply-topic cleanup that also runs when the call future is dropped.
struct CallCleanup {
    connection: Connection,
    pending: Arc<PendingTable>,
    id: String,
    reply_topic: String,
    finished: bool,
}

impl CallCleanup {
    fn new(connection: Connection, pending: Arc<PendingTable>, id: &str, reply_topic: &str) -> Self {
        Self {
            connection,
            pending,
            id: id.to_string(),
            reply_topic: reply_topic.to_string(),
            finished: false,
        }
    }

    async fn finish(mut self) {
        self.finished = true;
        self.connection.unsubscribe_quietly(&self.reply_topic).await;
    }
}

impl Drop for CallCleanup {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        self.pending.evict(&self.id);
        let connection = self.connection.clone();
        let reply_topic = std::mem::take(&mut self.reply_topic);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                connection.unsubscribe_quietly(&reply_topic).await;
            });
        }
    }
}
