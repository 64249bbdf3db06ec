//! tether-standalone: every service and the gateway in one process.
//!
//! Runs one worker router per service with a diagnostic topic on an
//! in-process broker, greets them all through the dispatcher and prints the
//! collected replies as JSON. Handy for checking a configuration's topic
//! catalog without a broker.

use tracing::{error, info, warn};

use tether::bus::ChannelBroker;
use tether::config::{BrokerBackend, Config};
use tether::services::welcome;
use tether::utils::bootstrap::{init_tracing, parse_config_path};
use tether::{ConnectionFactory, RequestDispatcher, RouterBuilder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting tether-standalone");
    if config.broker.backend != BrokerBackend::Channel {
        warn!(backend = ?config.broker.backend, "Standalone mode always uses the in-process broker");
    }

    let broker = ChannelBroker::new();
    let registry = config.topic_registry();

    let mut workers = Vec::new();
    for set in registry.sets().filter(|set| set.test_topic().is_some()) {
        let factory = ConnectionFactory::new(
            std::sync::Arc::new(broker.connector()),
            config.broker.clone(),
        );
        let router = RouterBuilder::new()
            .bundle(welcome::bundle(&registry, set.name())?)?
            .build();
        workers.push(router.start(factory.connect().await?).await?);
        info!(service = %set.name(), "Worker started");
    }

    let gateway = ConnectionFactory::new(std::sync::Arc::new(broker.connector()), config.broker.clone());
    let dispatcher = RequestDispatcher::from_config(gateway.connect().await?, &config.dispatcher);

    let outcome = welcome::probe_all(&dispatcher, &registry).await;

    dispatcher.shutdown();
    for worker in workers {
        worker.shutdown().await;
    }

    let replies = outcome.map_err(|e| {
        error!(error = %e, "Probe failed");
        e
    })?;
    println!("{}", serde_json::to_string_pretty(&replies)?);

    Ok(())
}
