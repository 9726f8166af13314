//! Message Broker Node
//!
//! Loads the broker configuration, builds a node with its control plane and
//! applies the configured addresses, queues, policy, diverts and bridges.
//! Runs until Ctrl+C or SIGTERM, then stops the node.
//!
//! ## Configuration
//!
//! - First argument: path to a TOML config file
//! - `MQ_CONFIG`: config file path when no argument is given
//! - `MQ_*` variables override individual settings
//!
//! Bridges may target the `local` in-VM connector, which loops back into
//! this node.

use anyhow::Result;
use mq_config::ConfigLoader;
use mq_control::Broker;
use tokio::signal;
use tracing::{error, info};

const LOCAL_CONNECTOR: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    mq_common::logging::init_logging("mq-server");

    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;
    info!(
        broker = %config.broker.name,
        addresses = config.addresses.len(),
        queues = config.queues.len(),
        "Starting message broker"
    );

    let broker = Broker::from_config(&config).await?;
    broker.connectors().register(broker.in_vm_connector(LOCAL_CONNECTOR));
    if let Err(e) = broker.apply_bridges(&config.bridges).await {
        error!(error = %e, "Failed to apply configured bridges");
        broker.stop().await;
        return Err(e.into());
    }

    let control = broker.control();
    info!(
        version = control.version(),
        addresses = control.get_address_names().len(),
        queues = control.get_queue_names(None)?.len(),
        diverts = control.get_divert_names().len(),
        bridges = control.get_bridge_names().len(),
        "Broker ready. Press Ctrl+C to shutdown."
    );

    shutdown_signal().await;
    info!("Shutdown signal received...");

    broker.stop().await;
    info!("Broker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
