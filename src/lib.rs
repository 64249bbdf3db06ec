//! Tether - request/response over pub/sub
//!
//! Lets independent processes that share only a publish/subscribe broker
//! make correlated, time-bounded calls to each other.
//!
//! Gateway side: `RequestDispatcher::call` publishes a request and awaits the
//! reply on a per-call reply topic. Worker side: `MessageRouter` delivers
//! requests to registered handlers, which publish their replies.

pub mod bus;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod fanout;
pub mod pending;
pub mod router;
pub mod services;
pub mod topics;
pub mod utils;

pub use connection::{Connection, ConnectionFactory, ConnectionState};
pub use dispatcher::RequestDispatcher;
pub use envelope::Envelope;
pub use error::{BridgeError, Result};
pub use fanout::FanOut;
pub use pending::PendingTable;
pub use router::{MessageRouter, RouterBuilder, RouterHandle};
pub use topics::{TopicRegistry, TopicSet};
