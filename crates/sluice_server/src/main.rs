//! Sluice node binary entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sluice_server::api;
use sluice_server::config::NodeConfig;
use sluice_server::metrics;
use sluice_server::Server;
use sluice_sql::push::source::LoopbackProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = NodeConfig::parse();
    config.validate()?;

    let server = Server::new(config.clone())?;
    // The in-process broker; external broker clients register here too.
    server.register_message_provider("loopback", Arc::new(LoopbackProvider::new()));
    server.start()?;

    let (api_addr, api_handle) = api::serve(server.state(), config.api_listen).await?;
    let (metrics_addr, metrics_handle) = metrics::serve(config.metrics_bind).await?;
    info!(%api_addr, %metrics_addr, "sluice node serving");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    api_handle.abort();
    metrics_handle.abort();
    server.stop()?;
    Ok(())
}
