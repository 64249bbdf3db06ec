//! Broker transport abstraction.
//!
//! This module contains:
//! - `Transport` trait: publish/subscribe/unsubscribe on hierarchical topics,
//!   plus one process-wide inbound stream of `(topic, bytes)` pairs
//! - `Connector` trait: a single connection attempt to a broker
//! - Implementations: in-process channel broker, NATS (feature `nats`)

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub mod channel;
#[cfg(feature = "nats")]
pub mod nats;

pub use channel::{ChannelBroker, ChannelConnector, ChannelTransport};
#[cfg(feature = "nats")]
pub use nats::{NatsConnector, NatsTransport};

/// Capacity of the inbound message and lifecycle event channels.
pub const CHANNEL_CAPACITY: usize = 1024;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors reported by a broker transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),

    #[error("Transport closed")]
    Closed,
}

/// One message delivered by the broker to this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Transport lifecycle signals.
///
/// Observable only: reconnection is left to the transport itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
    Error(String),
}

/// Live connection to a publish/subscribe broker.
///
/// Implementations:
/// - `ChannelTransport`: client of an in-process `ChannelBroker`
/// - `NatsTransport`: NATS core pub/sub
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish raw bytes to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Start receiving messages published to `topic` (filters allowed).
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Stop receiving messages for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Receiver for every message delivered to this process.
    ///
    /// Each receiver sees all inbound messages, whichever component subscribed.
    fn messages(&self) -> broadcast::Receiver<InboundMessage>;

    /// Receiver for lifecycle signals.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Factory performing a single connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;

    /// Broker address for logging.
    fn endpoint(&self) -> String;
}
