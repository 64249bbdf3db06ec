//! tether-worker: serves one service's topics over NATS.
//!
//! ## Lifecycle
//! 1. Connect to the broker (linear backoff, fatal after `broker.max_attempts`)
//! 2. Subscribe to the service's topics and route requests to its handlers
//! 3. On Ctrl+C, or if the router cannot start, unsubscribe and exit
//!
//! ## Configuration
//! - `service.name`: topic set to serve (e.g., "user", "chat")
//! - `broker.host` / `broker.port`: NATS server
//! - `TETHER_LOG`: log filter (default "info")

use tracing::{error, info};

use tether::config::Config;
use tether::services::welcome;
use tether::utils::bootstrap::{init_connector, init_tracing, parse_config_path};
use tether::{ConnectionFactory, RouterBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    let service = config.service.name.clone();
    info!(service = %service, "Starting tether-worker");

    let registry = config.topic_registry();
    let topics = registry.set(&service)?.topics().to_vec();
    let router = RouterBuilder::new()
        .bundle(welcome::bundle(&registry, &service)?)?
        .build();

    let connector = init_connector(&config.broker)?;
    let factory = ConnectionFactory::new(connector, config.broker.clone());
    let connection = factory.connect().await.map_err(|e| {
        error!(error = %e, "Broker unreachable; exiting");
        e
    })?;

    let handle = match router.start(connection.clone()).await {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Router failed to start; releasing topics");
            for topic in &topics {
                connection.unsubscribe_quietly(topic).await;
            }
            return Err(e.into());
        }
    };
    info!(service = %service, topics = ?handle.topics(), "Worker ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await;

    Ok(())
}
