//! Wire envelope exchanged over broker topics.
//!
//! Requests carry `correlationId` and `replyTopic`; replies carry
//! `correlationId`, `status` and either domain fields or `error.message`.
//! Every other field is opaque domain payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, Result};

pub const CORRELATION_ID_FIELD: &str = "correlationId";
pub const REPLY_TOPIC_FIELD: &str = "replyTopic";
pub const STATUS_FIELD: &str = "status";
pub const ERROR_FIELD: &str = "error";

/// Characters a correlation id may not contain: it becomes a reply topic level,
/// and these are level separators or wildcards on some broker.
pub const RESERVED_ID_CHARS: &[char] = &['/', '.', '#', '+', '*', '>'];

/// Message used when a failed reply carries no `error.message`.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Structured message body: a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Envelope with a freshly minted correlation id.
    pub fn request() -> Self {
        Self::new().with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    /// Parse a JSON object from raw bytes.
    ///
    /// Anything other than a JSON object is rejected.
    pub fn from_slice(topic: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice::<Self>(bytes).map_err(|e| BridgeError::MalformedMessage {
            topic: topic.to_string(),
            message: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // A map of JSON values always serializes.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(self, id: impl Into<String>) -> Self {
        self.with(CORRELATION_ID_FIELD, id.into())
    }

    pub fn with_reply_topic(self, topic: impl Into<String>) -> Self {
        self.with(REPLY_TOPIC_FIELD, topic.into())
    }

    pub fn with_status(self, status: u16) -> Self {
        self.with(STATUS_FIELD, status)
    }

    pub fn with_error(self, message: impl Into<String>) -> Self {
        let mut error = Map::new();
        error.insert("message".to_string(), Value::String(message.into()));
        self.with(ERROR_FIELD, Value::Object(error))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Correlation id, only when present and a string.
    pub fn correlation_id(&self) -> Option<&str> {
        self.get_str(CORRELATION_ID_FIELD)
    }

    pub fn reply_topic(&self) -> Option<&str> {
        self.get_str(REPLY_TOPIC_FIELD)
    }

    pub fn status(&self) -> Option<u16> {
        self.0
            .get(STATUS_FIELD)
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.0
            .get(ERROR_FIELD)
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
    }

    /// Validated correlation id for an outgoing request.
    pub fn require_correlation_id(&self) -> Result<&str> {
        match self.0.get(CORRELATION_ID_FIELD) {
            Some(Value::String(id)) if id.is_empty() => Err(BridgeError::Protocol(
                "correlationId must not be empty".to_string(),
            )),
            Some(Value::String(id))
                if id
                    .chars()
                    .any(|c| c.is_whitespace() || RESERVED_ID_CHARS.contains(&c)) =>
            {
                Err(BridgeError::Protocol(format!(
                    "correlationId '{}' contains a topic separator, wildcard or whitespace",
                    id
                )))
            }
            Some(Value::String(id)) => Ok(id),
            Some(_) => Err(BridgeError::Protocol(
                "correlationId must be a string".to_string(),
            )),
            None => Err(BridgeError::Protocol("correlationId is missing".to_string())),
        }
    }

    /// Reply envelope carrying this request's correlation id.
    pub fn reply(&self) -> Envelope {
        match self.correlation_id() {
            Some(id) => Envelope::new().with_correlation_id(id),
            None => Envelope::new(),
        }
    }

    /// Error reply for this request.
    pub fn error_reply(&self, status: u16, message: impl Into<String>) -> Envelope {
        self.reply().with_status(status).with_error(message)
    }

    /// Classify a reply by its `status` field.
    ///
    /// 200 and 201 are success; 500 is an internal failure of `service`;
    /// anything else is a rejection the caller should pass through.
    pub fn check_status(&self, service: &str) -> std::result::Result<(), ReplyFailure> {
        let status = self.status();
        if matches!(status, Some(200) | Some(201)) {
            return Ok(());
        }

        let message = self.error_message().unwrap_or(UNKNOWN_ERROR).to_string();
        match status {
            Some(500) | None => Err(ReplyFailure::Internal {
                service: service.to_string(),
                message,
            }),
            Some(status) => Err(ReplyFailure::Rejected { status, message }),
        }
    }

    /// Domain body of a reply with bridge bookkeeping removed.
    pub fn into_body(mut self) -> Envelope {
        self.0.remove(CORRELATION_ID_FIELD);
        self.0.remove(STATUS_FIELD);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Non-success reply classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyFailure {
    #[error("{service}: {message}")]
    Internal { service: String, message: String },

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl From<ReplyFailure> for BridgeError {
    fn from(failure: ReplyFailure) -> Self {
        match failure {
            ReplyFailure::Internal { .. } => BridgeError::Remote {
                status: 500,
                message: failure.to_string(),
            },
            ReplyFailure::Rejected { status, message } => BridgeError::Remote { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(Envelope::from_slice("t", b"[1,2,3]").is_err());
        assert!(Envelope::from_slice("t", b"not json").is_err());
        let env = Envelope::from_slice("t", br#"{"correlationId":"abc","name":"x"}"#).unwrap();
        assert_eq!(env.correlation_id(), Some("abc"));
        assert_eq!(env.get_str("name"), Some("x"));
    }

    #[test]
    fn test_require_correlation_id() {
        assert!(Envelope::new()
            .with_correlation_id("abc")
            .require_correlation_id()
            .is_ok());
        assert!(matches!(
            Envelope::new().require_correlation_id(),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            Envelope::new()
                .with(CORRELATION_ID_FIELD, 42)
                .require_correlation_id(),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_correlation_id_must_fit_one_topic_level() {
        for id in ["order.42", "a/b", "#", "user+1", "x*", "a>b", "two words", "tab\tid"] {
            assert!(
                matches!(
                    Envelope::new().with_correlation_id(id).require_correlation_id(),
                    Err(BridgeError::Protocol(_))
                ),
                "accepted {:?}",
                id
            );
        }
        for id in ["order-42", "order_42", "ORDER:42", "9f1c2d3e-aaaa-4bbb-8ccc-123456789abc"] {
            assert_eq!(
                Envelope::new()
                    .with_correlation_id(id)
                    .require_correlation_id()
                    .unwrap(),
                id
            );
        }
        let minted = Envelope::request();
        assert!(minted.require_correlation_id().is_ok());
    }

    #[test]
    fn test_request_mints_unique_ids() {
        let a = Envelope::request();
        let b = Envelope::request();
        assert_ne!(a.correlation_id(), b.correlation_id());
    }

    #[test]
    fn test_error_reply_copies_correlation_id() {
        let request = Envelope::new()
            .with_correlation_id("abc")
            .with_reply_topic("POST/users/abc");
        let reply = request.error_reply(500, "boom");
        assert_eq!(reply.correlation_id(), Some("abc"));
        assert_eq!(reply.status(), Some(500));
        assert_eq!(reply.error_message(), Some("boom"));
        assert_eq!(reply.reply_topic(), None);
    }

    #[test]
    fn test_check_status() {
        let ok = Envelope::new().with_status(201);
        assert!(ok.check_status("user").is_ok());

        let internal = Envelope::new().with_status(500).with_error("db down");
        assert_eq!(
            internal.check_status("user"),
            Err(ReplyFailure::Internal {
                service: "user".to_string(),
                message: "db down".to_string(),
            })
        );

        let conflict = Envelope::new().with_status(409);
        assert_eq!(
            conflict.check_status("user"),
            Err(ReplyFailure::Rejected {
                status: 409,
                message: UNKNOWN_ERROR.to_string(),
            })
        );
    }

    #[test]
    fn test_into_body_strips_bookkeeping() {
        let reply = Envelope::from(
            json!({"correlationId": "abc", "status": 201, "name": "x"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(reply.into_body().into_value(), json!({"name": "x"}));
    }

    #[test]
    fn test_reply_failure_into_bridge_error() {
        let internal: BridgeError = ReplyFailure::Internal {
            service: "user".to_string(),
            message: "db down".to_string(),
        }
        .into();
        assert_eq!(
            internal,
            BridgeError::Remote {
                status: 500,
                message: "user: db down".to_string(),
            }
        );
    }
}
