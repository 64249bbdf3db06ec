//! Worker side of the bridge.
//!
//! A `MessageRouter` is built once from `{topic -> handler}` registrations,
//! subscribes to every registered topic and runs each inbound request's
//! handler on its own task. A handler that fails or panics is answered with
//! an error reply (status 500, original correlation id) so the caller rejects
//! instead of waiting for its deadline.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::bus::InboundMessage;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::topics::topic_matches;

/// Status carried by replies the router sends for failed handlers.
pub const HANDLER_FAILURE_STATUS: u16 = 500;

/// Worker-side request handler.
///
/// The handler owns the reply: it publishes to the request's `replyTopic`
/// (see `Connection::reply`). Returning an error makes the router reply
/// with an error envelope instead.
pub trait ReplyHandler: Send + Sync {
    fn handle(&self, request: Envelope, connection: Connection) -> BoxFuture<'static, Result<()>>;
}

/// Handler built from an async closure.
pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> ReplyHandler for HandlerFn<F>
where
    F: Fn(Envelope, Connection) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, request: Envelope, connection: Connection) -> BoxFuture<'static, Result<()>> {
        (self.f)(request, connection).boxed()
    }
}

/// Wrap an async closure as a `ReplyHandler`.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Envelope, Connection) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

/// Handler that computes a response and lets the router publish it.
pub struct RespondFn<F> {
    f: F,
}

impl<F, Fut> ReplyHandler for RespondFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Envelope>> + Send + 'static,
{
    fn handle(&self, request: Envelope, connection: Connection) -> BoxFuture<'static, Result<()>> {
        let response = (self.f)(request.clone());
        async move {
            let response = response.await?;
            connection.reply(&request, response).await
        }
        .boxed()
    }
}

/// Wrap an async `request -> response` closure as a `ReplyHandler`.
pub fn respond_fn<F, Fut>(f: F) -> RespondFn<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Envelope>> + Send + 'static,
{
    RespondFn { f }
}

/// Set of `{topic -> handler}` registrations owned by one service.
pub type HandlerBundle = Vec<(String, Arc<dyn ReplyHandler>)>;

/// Collects handler registrations, refusing topic collisions.
#[derive(Default)]
pub struct RouterBuilder {
    handlers: BTreeMap<String, Arc<dyn ReplyHandler>>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(self, topic: impl Into<String>, handler: impl ReplyHandler + 'static) -> Result<Self> {
        self.register_arc(topic, Arc::new(handler))
    }

    pub fn register_arc(
        mut self,
        topic: impl Into<String>,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<Self> {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(BridgeError::DuplicateTopic(topic));
        }
        self.handlers.insert(topic, handler);
        Ok(self)
    }

    /// Register every handler of a bundle.
    pub fn bundle(self, bundle: HandlerBundle) -> Result<Self> {
        bundle
            .into_iter()
            .try_fold(self, |builder, (topic, handler)| builder.register_arc(topic, handler))
    }

    pub fn build(self) -> MessageRouter {
        MessageRouter {
            handlers: Arc::new(self.handlers),
        }
    }
}

type Handlers = Arc<BTreeMap<String, Arc<dyn ReplyHandler>>>;

/// Demultiplexes inbound requests to handlers by topic.
///
/// Registered topics may be `+`/`#` filters; an exact registration wins over
/// a matching filter.
pub struct MessageRouter {
    handlers: Handlers,
}

impl MessageRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Subscribe to every registered topic and start consuming.
    ///
    /// A subscription failure aborts startup; topics subscribed so far are
    /// released again.
    pub async fn start(self, connection: Connection) -> Result<RouterHandle> {
        let messages = connection.messages();

        let mut subscribed: Vec<String> = Vec::with_capacity(self.handlers.len());
        for topic in self.handlers.keys() {
            if let Err(e) = connection.subscribe(topic).await {
                error!(topic = %topic, error = %e, "Router subscription failed");
                for done in &subscribed {
                    connection.unsubscribe_quietly(done).await;
                }
                return Err(e);
            }
            subscribed.push(topic.clone());
        }
        info!(topics = ?subscribed, "Router subscribed");

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(consume(
            messages,
            stop_rx,
            Arc::clone(&self.handlers),
            connection.clone(),
        ));

        Ok(RouterHandle {
            connection,
            topics: subscribed,
            stop: Some(stop),
            task,
        })
    }
}

/// Running router; `shutdown` stops consuming and unsubscribes.
pub struct RouterHandle {
    connection: Connection,
    topics: Vec<String>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Whether the consumer loop has stopped (connection closed or shut down).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Router consumer ended abnormally");
        }
        for topic in &self.topics {
            self.connection.unsubscribe_quietly(topic).await;
        }
        info!(topics = ?self.topics, "Router unsubscribed");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn consume(
    mut messages: broadcast::Receiver<InboundMessage>,
    mut stop: oneshot::Receiver<()>,
    handlers: Handlers,
    connection: Connection,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            next = messages.recv() => match next {
                Ok(message) => route(&handlers, &connection, message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Router lagged; requests dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Router consumer stopped");
}

fn route(handlers: &Handlers, connection: &Connection, message: InboundMessage) {
    // The inbound stream is shared, so most foreign topics are other components' traffic.
    let Some(handler) = find_handler(handlers, &message.topic) else {
        debug!(topic = %message.topic, "No handler for topic; dropped");
        return;
    };

    let request = match Envelope::from_slice(&message.topic, &message.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed request dropped");
            return;
        }
    };

    tokio::spawn(run_handler(
        message.topic,
        Arc::clone(handler),
        request,
        connection.clone(),
    ));
}

/// Exact registration first, then the first wildcard filter (in topic order)
/// that matches.
fn find_handler<'a>(handlers: &'a Handlers, topic: &str) -> Option<&'a Arc<dyn ReplyHandler>> {
    handlers.get(topic).or_else(|| {
        handlers
            .iter()
            .find(|(filter, _)| topic_matches(topic, filter))
            .map(|(_, handler)| handler)
    })
}

#[instrument(name = "router.handle", skip_all, fields(topic = %topic, correlation_id = request.correlation_id().unwrap_or_default()))]
async fn run_handler(
    topic: String,
    handler: Arc<dyn ReplyHandler>,
    request: Envelope,
    connection: Connection,
) {
    // Handlers may panic while building their future as well as while polling it.
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| {
        handler.handle(request.clone(), connection.clone())
    })) {
        Ok(invocation) => {
            AssertUnwindSafe(invocation.in_current_span())
                .catch_unwind()
                .await
        }
        Err(panic) => Err(panic),
    };
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(_) => "handler panicked".to_string(),
    };

    let failure = BridgeError::Handler {
        topic: topic.clone(),
        message: message.clone(),
    };
    error!(error = %failure, "Handler failed");

    if request.reply_topic().is_none() {
        warn!("Handler failure not reported: request has no reply topic");
        return;
    }
    let reply = request.error_reply(HANDLER_FAILURE_STATUS, message);
    if let Err(e) = connection.reply(&request, reply).await {
        warn!(error = %e, "Failed to publish error reply");
    }
}

#[cfg(test)]
mod tests;
