//! Crate-wide error type.
//!
//! Errors local to one call (timeout, publish failure, protocol error) are
//! delivered only to that call's waiter. Only `Connection` is process-fatal.

use std::time::Duration;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors surfaced by the request/response bridge.
///
/// `Clone` so a single settlement outcome can be logged and handed to the waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to connect to broker after {attempts} attempts: {cause}")]
    Connection { attempts: u32, cause: String },

    #[error("Failed to subscribe to topic '{topic}': {message}")]
    Subscription { topic: String, message: String },

    #[error("Failed to unsubscribe from topic '{topic}': {message}")]
    Unsubscription { topic: String, message: String },

    #[error("Failed to publish to topic '{topic}': {message}")]
    Publish { topic: String, message: String },

    #[error("Timeout: no reply on '{reply_topic}' for correlation id '{correlation_id}' within {timeout:?}")]
    Timeout {
        reply_topic: String,
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message on topic '{topic}': {message}")]
    MalformedMessage { topic: String, message: String },

    #[error("Handler for topic '{topic}' failed: {message}")]
    Handler { topic: String, message: String },

    #[error("Remote service error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Topic '{topic}' not found in set '{set}'")]
    TopicNotFound { set: String, topic: String },

    #[error("Topic '{0}' registered more than once")]
    DuplicateTopic(String),

    #[error("Bridge shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the owning process should terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_are_fatal() {
        let connection = BridgeError::Connection {
            attempts: 5,
            cause: "refused".to_string(),
        };
        assert!(connection.is_fatal());
        assert!(!BridgeError::Protocol("missing".to_string()).is_fatal());
        assert!(!BridgeError::Shutdown.is_fatal());
    }

    #[test]
    fn test_connection_error_names_attempts_and_cause() {
        let err = BridgeError::Connection {
            attempts: 2,
            cause: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("2 attempts"));
        assert!(text.contains("connection refused"));
    }
}
