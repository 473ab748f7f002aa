//! mcp-render server entry point.
//!
//! This is the main binary that boots the MCP server on stdio transport.
//! Logging goes to stderr to avoid interfering with the JSON-RPC protocol on stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rendr_client::{BrowserDriver, BrowserLifecycleManager, RenderCoordinator, default_pipeline};
use rendr_core::{AppConfig, CacheDb};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod handler;
mod tools;

/// How often the maintenance task checks for instances due a restart.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = Arc::new(AppConfig::load()?);
    let cache = CacheDb::from_config(&config).await?;

    let lifecycle = BrowserLifecycleManager::from_config(driver(&config)?, &config);
    if let Err(e) = lifecycle.start().await {
        tracing::warn!("Browser not available at startup, retrying on first render: {e}");
    }
    let maintenance = lifecycle.spawn_maintenance(MAINTENANCE_INTERVAL);

    let pipeline = default_pipeline(&config, cache.clone());
    let coordinator = RenderCoordinator::new(config, lifecycle.clone(), pipeline);

    tracing::info!("Starting mcp-render server on stdio transport");

    let handler = handler::McpRenderServer::new(coordinator, cache);
    let transport = stdio();
    let server = serve_server(handler, transport).await?;

    let result = server.waiting().await;

    maintenance.abort();
    lifecycle.shutdown().await;
    result?;

    Ok(())
}

#[cfg(feature = "render")]
fn driver(config: &AppConfig) -> Result<Arc<dyn BrowserDriver>> {
    Ok(Arc::new(rendr_client::ChromiumDriver::from_config(config)))
}

#[cfg(not(feature = "render"))]
fn driver(_config: &AppConfig) -> Result<Arc<dyn BrowserDriver>> {
    anyhow::bail!("mcp-render was built without the `render` feature")
}
