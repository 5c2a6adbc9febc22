//! gli-relay, collaboration relay for contract drafts.
//!
//! Usage: `gli-relay [config.toml]`. Without a file the relay listens on
//! the default address. Logging follows `RUST_LOG`.

use gli_draft_sync::{RelayConfig, RelayServer};
use log::{error, info};
use tokio::net::TcpListener;

fn load_config() -> Result<RelayConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            let config: RelayConfig = toml::from_str(&text)?;
            info!("Loaded relay configuration from {path}");
            Ok(config)
        }
        None => Ok(RelayConfig::default()),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    info!("Starting gli-relay...");

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot bind {}: {e}", config.bind_addr);
            std::process::exit(1);
        }
    };
    let relay = RelayServer::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    if let Err(e) = relay.serve(listener, shutdown).await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
