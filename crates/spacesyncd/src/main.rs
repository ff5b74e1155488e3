//! spacesyncd - replicated object space synchronization daemon
//!
//! Keeps CRDT object spaces converged across peers: detects divergence
//! with range-hash diffs, bootstraps spaces onto peers that lack them,
//! and feeds changed object ids to the retrieval layer.

use clap::Parser;
use spacesyncd::config::Config;
use spacesyncd::server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    let default_level = if config.verbose {
        "spacesyncd=debug"
    } else {
        "spacesyncd=info"
    };
    let filter = EnvFilter::from_default_env().add_directive(default_level.parse().unwrap());
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!(
        "spacesyncd v{} - object space sync daemon",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(err) = config.validate() {
        error!("Invalid configuration: {}", err);
        return ExitCode::FAILURE;
    }

    match Server::new(config) {
        Ok(server) => {
            let server = Arc::new(server);

            let shutdown_server = server.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received shutdown signal");
                shutdown_server.shutdown();
            });

            if let Err(err) = server.run().await {
                error!("Server error: {}", err);
                return ExitCode::FAILURE;
            }
        }
        Err(err) => {
            error!("Failed to initialize server: {}", err);
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
