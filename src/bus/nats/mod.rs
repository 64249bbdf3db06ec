//! NATS core pub/sub transport.
//!
//! Topics map onto NATS subjects by swapping the level separator:
//! `POST/users/abc` is published as `POST.users.abc`. Filter wildcards map
//! `#` to `>` and `+` to `*`.
//!
//! # Configuration
//!
//! ```yaml
//! broker:
//!   backend: nats
//!   host: localhost
//!   port: 4222
//! ```
//!
//! Each subscription gets a forwarding task that copies messages onto the
//! transport's shared inbound channel until it is told to stop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    BusError, Connector, InboundMessage, Result, Transport, TransportEvent, CHANNEL_CAPACITY,
};

const SUBJECT_SEPARATOR: char = '.';

/// Convert a `/`-separated topic or filter into a NATS subject.
pub fn topic_to_subject(topic: &str) -> String {
    topic
        .split('/')
        .map(|level| match level {
            "#" => ">",
            "+" => "*",
            other => other,
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Convert a NATS subject back into a `/`-separated topic.
pub fn subject_to_topic(subject: &str) -> String {
    subject.replace(SUBJECT_SEPARATOR, "/")
}

fn map_event(event: async_nats::Event) -> TransportEvent {
    match event {
        async_nats::Event::Connected => TransportEvent::Connected,
        async_nats::Event::Disconnected => TransportEvent::Disconnected,
        other => TransportEvent::Error(other.to_string()),
    }
}

struct Forwarder {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

/// Live NATS connection.
pub struct NatsTransport {
    client: async_nats::Client,
    inbound: broadcast::Sender<InboundMessage>,
    events: broadcast::Sender<TransportEvent>,
    forwarders: Mutex<HashMap<String, Forwarder>>,
}

impl NatsTransport {
    async fn forward(
        mut subscriber: async_nats::Subscriber,
        mut stop: oneshot::Receiver<()>,
        inbound: broadcast::Sender<InboundMessage>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = &mut stop => {
                    return subscriber
                        .unsubscribe()
                        .await
                        .map_err(|e| BusError::Unsubscribe(e.to_string()));
                }
                next = subscriber.next() => match next {
                    Some(message) => {
                        let topic = subject_to_topic(&message.subject);
                        let _ = inbound.send(InboundMessage::new(topic, message.payload));
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic_to_subject(topic), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if self.forwarders.lock().contains_key(topic) {
            debug!(topic = %topic, "Already subscribed");
            return Ok(());
        }

        let subscriber = self
            .client
            .subscribe(topic_to_subject(topic))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(Self::forward(subscriber, stop_rx, self.inbound.clone()));

        if let Some(previous) = self
            .forwarders
            .lock()
            .insert(topic.to_string(), Forwarder { stop, task })
        {
            // Lost a subscribe race on the same topic; retire the older forwarder.
            let _ = previous.stop.send(());
        }
        debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let Some(forwarder) = self.forwarders.lock().remove(topic) else {
            debug!(topic = %topic, "Unsubscribe for unknown topic ignored");
            return Ok(());
        };

        let _ = forwarder.stop.send(());
        forwarder
            .task
            .await
            .map_err(|e| BusError::Unsubscribe(e.to_string()))?
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Connector for a NATS server.
#[derive(Clone, Debug)]
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        let event_tx = events.clone();

        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let event_tx = event_tx.clone();
                async move {
                    let event = map_event(event);
                    if let TransportEvent::Error(ref message) = event {
                        warn!(error = %message, "NATS client event");
                    }
                    let _ = event_tx.send(event);
                }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        info!(url = %self.url, "Connected to NATS");

        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Arc::new(NatsTransport {
            client,
            inbound,
            events,
            forwarders: Mutex::new(HashMap::new()),
        }))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
