//! Bootstrap utilities for tether binaries.
//!
//! Shared initialization code for the worker and standalone binaries.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{ChannelBroker, Connector};
use crate::config::{BrokerBackend, BrokerConfig, LOG_ENV_VAR};
use crate::error::Result;

/// Command-line flag naming a configuration file.
pub const CONFIG_FLAG: &str = "--config";

/// Initialize tracing with TETHER_LOG environment variable.
///
/// Defaults to "info" level if TETHER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Configuration file path from `--config <path>` or `--config=<path>`.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == CONFIG_FLAG {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Build the connector for the configured backend.
///
/// The channel backend gets a fresh in-process broker; use
/// `ChannelBroker::connector` directly to share one between components.
pub fn init_connector(config: &BrokerConfig) -> Result<Arc<dyn Connector>> {
    config.validate()?;

    match config.backend {
        BrokerBackend::Channel => Ok(Arc::new(ChannelBroker::new().connector())),
        #[cfg(feature = "nats")]
        BrokerBackend::Nats => Ok(Arc::new(crate::bus::NatsConnector::new(config.url()))),
        #[cfg(not(feature = "nats"))]
        BrokerBackend::Nats => Err(crate::error::BridgeError::Config(
            "NATS backend requires the 'nats' feature".to_string(),
        )),
    }
}
