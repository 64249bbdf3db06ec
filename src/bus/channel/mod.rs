//! In-memory channel-based broker for standalone mode.
//!
//! Uses tokio broadcast channels for pub/sub within a single process.
//! Ideal for local development and testing without external dependencies.
//! Supports fault injection so every failure path of the bridge can be driven.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    BusError, Connector, InboundMessage, Result, Transport, TransportEvent, CHANNEL_CAPACITY,
};
use crate::topics::topic_matches;

/// Endpoint name reported by channel connectors.
pub const CHANNEL_ENDPOINT: &str = "channel://in-process";

struct Client {
    filters: BTreeSet<String>,
    inbound: broadcast::Sender<InboundMessage>,
    events: broadcast::Sender<TransportEvent>,
}

#[derive(Default)]
struct Faults {
    connect_failures: AtomicU32,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    fail_unsubscribe: AtomicBool,
}

#[derive(Default)]
struct BrokerInner {
    clients: Mutex<HashMap<u64, Client>>,
    next_id: AtomicU64,
    connect_attempts: AtomicU32,
    published: AtomicU64,
    faults: Faults,
}

/// In-process broker shared by every `ChannelTransport` connected to it.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct ChannelBroker {
    inner: Arc<BrokerInner>,
}

impl ChannelBroker {
    /// Create a new, empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector whose attempts land on this broker.
    pub fn connector(&self) -> ChannelConnector {
        ChannelConnector::new(self.clone())
    }

    /// Connect a new client, honouring injected connect failures.
    pub fn connect(&self) -> Result<ChannelTransport> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let failures = &self.inner.faults.connect_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BusError::Connect("connection refused".to_string()));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);

        self.inner.clients.lock().insert(
            id,
            Client {
                filters: BTreeSet::new(),
                inbound: inbound.clone(),
                events: events.clone(),
            },
        );

        info!(client = id, "Channel broker client connected");

        Ok(ChannelTransport {
            id,
            broker: self.clone(),
            inbound,
            events,
        })
    }

    /// Fail the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.faults.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.faults.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_subscribe(&self, fail: bool) {
        self.inner.faults.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_unsubscribe(&self, fail: bool) {
        self.inner
            .faults
            .fail_unsubscribe
            .store(fail, Ordering::SeqCst);
    }

    /// Send a lifecycle signal to every connected client.
    pub fn emit_event(&self, event: TransportEvent) {
        for client in self.inner.clients.lock().values() {
            let _ = client.events.send(event.clone());
        }
    }

    /// Number of connection attempts seen, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of messages accepted for delivery.
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Total active subscriptions across all clients.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .clients
            .lock()
            .values()
            .map(|c| c.filters.len())
            .sum()
    }

    /// Deliver a message to every client with a matching filter.
    ///
    /// A client receives each message at most once.
    fn route(&self, topic: &str, payload: Bytes) -> usize {
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        let clients = self.inner.clients.lock();
        let mut delivered = 0;
        for client in clients.values() {
            if client.filters.iter().any(|f| topic_matches(topic, f)) {
                // No receivers is fine: nobody in that process is listening yet.
                let _ = client
                    .inbound
                    .send(InboundMessage::new(topic, payload.clone()));
                delivered += 1;
            }
        }
        delivered
    }

    fn add_filter(&self, id: u64, topic: &str) -> Result<()> {
        match self.inner.clients.lock().get_mut(&id) {
            Some(client) => {
                client.filters.insert(topic.to_string());
                Ok(())
            }
            None => Err(BusError::Closed),
        }
    }

    fn remove_filter(&self, id: u64, topic: &str) -> Result<()> {
        match self.inner.clients.lock().get_mut(&id) {
            Some(client) => {
                client.filters.remove(topic);
                Ok(())
            }
            None => Err(BusError::Closed),
        }
    }

    fn filters(&self, id: u64) -> Vec<String> {
        self.inner
            .clients
            .lock()
            .get(&id)
            .map(|c| c.filters.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn disconnect(&self, id: u64) {
        if self.inner.clients.lock().remove(&id).is_some() {
            debug!(client = id, "Channel broker client disconnected");
        }
    }
}

/// One process's connection to a `ChannelBroker`.
pub struct ChannelTransport {
    id: u64,
    broker: ChannelBroker,
    inbound: broadcast::Sender<InboundMessage>,
    events: broadcast::Sender<TransportEvent>,
}

impl ChannelTransport {
    /// Topics this client is currently subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        self.broker.filters(self.id)
    }

    /// Simulate a transport-level signal (reconnect, error, ...).
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Close the connection; later operations fail with `BusError::Closed`.
    pub fn close(&self) {
        self.broker.disconnect(self.id);
        self.emit(TransportEvent::Closed);
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    #[tracing::instrument(name = "channel.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if self.broker.inner.faults.fail_publish.load(Ordering::SeqCst) {
            return Err(BusError::Publish("injected publish failure".to_string()));
        }
        if !self.broker.inner.clients.lock().contains_key(&self.id) {
            return Err(BusError::Closed);
        }

        let receivers = self.broker.route(topic, payload);
        debug!(receivers, "Published to channel broker");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if self
            .broker
            .inner
            .faults
            .fail_subscribe
            .load(Ordering::SeqCst)
        {
            return Err(BusError::Subscribe(
                "injected subscribe failure".to_string(),
            ));
        }
        self.broker.add_filter(self.id, topic)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if self
            .broker
            .inner
            .faults
            .fail_unsubscribe
            .load(Ordering::SeqCst)
        {
            return Err(BusError::Unsubscribe(
                "injected unsubscribe failure".to_string(),
            ));
        }
        self.broker.remove_filter(self.id, topic)
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Connector producing clients of a shared `ChannelBroker`.
#[derive(Clone)]
pub struct ChannelConnector {
    broker: ChannelBroker,
}

impl ChannelConnector {
    pub fn new(broker: ChannelBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.broker.connect()?;
        Ok(Arc::new(transport))
    }

    fn endpoint(&self) -> String {
        CHANNEL_ENDPOINT.to_string()
    }
}
