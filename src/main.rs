//! switchboard: serve the demo key/value handler over RESP.
//!
//! Configuration comes from CLI arguments or a TOML file. Ctrl-C stops
//! accepting connections and waits up to the configured shutdown timeout
//! for open ones to finish.

use std::sync::Arc;
use switchboard::config::Config;
use switchboard::demo::KvHandler;
use switchboard::pubsub::Hub;
use switchboard::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        databases = config.databases,
        channel_capacity = config.channel_capacity,
        shutdown_timeout_secs = config.shutdown_timeout.as_secs(),
        "Starting switchboard"
    );

    let hub = Arc::new(Hub::new(config.channel_capacity));
    let handler = Arc::new(KvHandler::new(hub, config.databases));
    let server = Arc::new(Server::new(config.listen.clone(), handler)?);

    let serving = Arc::clone(&server);
    let mut accept_loop = tokio::spawn(async move { serving.start().await });

    tokio::select! {
        result = &mut accept_loop => {
            // The accept loop only returns on its own when binding failed.
            result??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    match server.stop(config.shutdown_timeout).await {
        Ok(()) => info!("All connections closed"),
        Err(e) => warn!(
            error = %e,
            active = server.active_connections(),
            "Connections still open at shutdown"
        ),
    }

    if let Err(e) = accept_loop.await? {
        error!(error = %e, "Accept loop failed");
    }
    Ok(())
}
