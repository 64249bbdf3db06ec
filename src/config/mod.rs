//! Process configuration: broker, dispatcher, worker identity and topic sets.
//!
//! Loaded from YAML files layered with `TETHER__SECTION__KEY` env vars.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::topics::TopicRegistry;

/// Optional file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Names an extra YAML file to load.
pub const CONFIG_ENV_VAR: &str = "TETHER_CONFIG";
/// `TETHER__BROKER__HOST=...` style overrides.
pub const CONFIG_ENV_PREFIX: &str = "TETHER";
/// `EnvFilter` directives for the binaries.
pub const LOG_ENV_VAR: &str = "TETHER_LOG";

/// Broker backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process channel broker (no external broker).
    #[default]
    Channel,
    /// NATS server (requires the `nats` feature).
    Nats,
}

/// Broker connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    pub host: String,
    pub port: u16,
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
    /// Wait before retry `n` is `n * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::Channel,
            host: "localhost".to_string(),
            port: 4222,
            max_attempts: 5,
            retry_base_delay_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BridgeError::Config("broker.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(BridgeError::Config("broker.port must not be 0".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(BridgeError::Config(
                "broker.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Gateway-side request settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub default_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
        }
    }
}

impl DispatcherConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Worker identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Topic set served by this worker.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "user".to_string(),
        }
    }
}

/// Everything a gateway or worker process reads at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
    pub service: ServiceConfig,
    /// Topic sets layered over the built-in catalog.
    pub topics: HashMap<String, Vec<String>>,
}

impl Config {
    /// Layer every source and validate the broker section.
    ///
    /// Later sources win: `config.yaml` in the working directory, then
    /// `path`, then the file named by `TETHER_CONFIG`, then `TETHER__*` vars.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(explicit) = path {
            builder = builder.add_source(File::new(explicit, FileFormat::Yaml).required(true));
        }
        if let Ok(from_env) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&from_env, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        config.broker.validate()?;
        Ok(config)
    }

    /// Built-in topic catalog with configured overrides.
    pub fn topic_registry(&self) -> TopicRegistry {
        TopicRegistry::from_config(&self.topics)
    }
}
