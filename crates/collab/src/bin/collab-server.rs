//! Standalone collaboration authority over WebSocket.
//!
//! Usage: `collab-server [config.json]`. Log verbosity follows `RUST_LOG`.

use anyhow::Context;
use collab::server::{CollaborationServer, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn load_config() -> anyhow::Result<ServerConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(ServerConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config()?;
    tracing::info!(
        address = %config.socket_addr(),
        history_retention = config.authority.history_retention,
        "Starting collaboration server"
    );

    let server = CollaborationServer::new(config);
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
