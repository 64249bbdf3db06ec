//! Broker connection lifecycle.
//!
//! `ConnectionFactory` owns the process-wide connection. The first `connect()`
//! runs the retry loop; concurrent first-time callers share that one attempt
//! and every later caller gets the cached handle, or the cached failure.
//! After a successful connect, transport events only update the observable
//! state; reconnection is the transport's own business.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use bytes::Bytes;
use tokio::sync::{broadcast, watch, OnceCell};
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, Connector, InboundMessage, Transport, TransportEvent};
use crate::config::BrokerConfig;
use crate::envelope::Envelope;
use crate::error::{BridgeError, Result};
use crate::utils::retry::connection_backoff;

/// Observable connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; terminal.
    Failed,
}

/// Cheap, cloneable handle to the shared broker connection.
#[derive(Clone)]
pub struct Connection {
    transport: Arc<dyn Transport>,
    attempts: u32,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            attempts: 1,
        }
    }

    /// Attempts it took to establish this connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<()> {
        self.publish_bytes(topic, Bytes::from(envelope.to_bytes()))
            .await
    }

    pub async fn publish_bytes(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.transport
            .publish(topic, payload)
            .await
            .map_err(|e| BridgeError::Publish {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.transport
            .subscribe(topic)
            .await
            .map_err(|e| BridgeError::Subscription {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.transport
            .unsubscribe(topic)
            .await
            .map_err(|e| BridgeError::Unsubscription {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    /// Unsubscribe, logging instead of returning a failure.
    pub async fn unsubscribe_quietly(&self, topic: &str) {
        if let Err(e) = self.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Unsubscribe failed");
        }
    }

    /// Answer `request` on its `replyTopic` with its correlation id copied in.
    pub async fn reply(&self, request: &Envelope, mut response: Envelope) -> Result<()> {
        let reply_topic = request
            .reply_topic()
            .ok_or_else(|| BridgeError::Protocol("No reply topic provided".to_string()))?;

        if let Some(id) = request.correlation_id() {
            response = response.with_correlation_id(id);
        }
        self.publish(reply_topic, &response).await
    }

    pub fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.transport.messages()
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.transport.events()
    }
}

/// Connect through `connector`, retrying with linear backoff.
///
/// Fails with `BridgeError::Connection` naming the attempts made and the last cause.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    config: &BrokerConfig,
) -> Result<Connection> {
    let endpoint = connector.endpoint();
    let max_attempts = config.max_attempts;
    let counter = AtomicU32::new(0);

    let attempts = &counter;
    let endpoint_ref = endpoint.as_str();
    let result = (move || async move {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(attempt, max_attempts, endpoint = %endpoint_ref, "Connecting to broker");
        connector.connect().await
    })
    .retry(connection_backoff(config))
    .notify(|err: &BusError, delay: Duration| {
        warn!(
            attempt = attempts.load(Ordering::SeqCst),
            max_attempts,
            error = %err,
            delay = ?delay,
            "Broker connection failed, retrying"
        );
    })
    .await;

    let attempts = counter.load(Ordering::SeqCst);
    match result {
        Ok(transport) => {
            info!(endpoint = %endpoint, attempts, "Connected to broker");
            Ok(Connection {
                transport,
                attempts,
            })
        }
        Err(e) => {
            error!(endpoint = %endpoint, attempts, error = %e, "Giving up on broker connection");
            Err(BridgeError::Connection {
                attempts,
                cause: e.to_string(),
            })
        }
    }
}

/// Owner of the process-wide connection.
pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    cell: OnceCell<Result<Connection>>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            config,
            cell: OnceCell::new(),
            state: Arc::new(state),
        }
    }

    /// Shared connection handle, connecting on first use.
    pub async fn connect(&self) -> Result<Connection> {
        self.cell
            .get_or_init(|| async {
                self.state.send_replace(ConnectionState::Connecting);
                let result = connect_with_retry(self.connector.as_ref(), &self.config).await;
                match &result {
                    Ok(connection) => {
                        self.state.send_replace(ConnectionState::Connected);
                        self.watch_events(connection.events());
                    }
                    Err(_) => {
                        self.state.send_replace(ConnectionState::Failed);
                    }
                }
                result
            })
            .await
            .clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn watch_events(&self, mut events: broadcast::Receiver<TransportEvent>) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let next = match &event {
                            TransportEvent::Connected => Some(ConnectionState::Connected),
                            TransportEvent::Reconnecting => Some(ConnectionState::Connecting),
                            TransportEvent::Disconnected | TransportEvent::Closed => {
                                Some(ConnectionState::Disconnected)
                            }
                            TransportEvent::Error(message) => {
                                warn!(error = %message, "Broker transport error");
                                None
                            }
                        };
                        if let Some(next) = next {
                            info!(event = ?event, "Broker connection state changed");
                            state.send_replace(next);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Missed broker transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}
