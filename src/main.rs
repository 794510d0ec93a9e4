//! Range relay server
//!
//! Loads configuration, sets up logging, and starts the relay front server
//! plus the optional metrics endpoint.

use anyhow::Context;
use range_relay::{HttpBackend, MetricsEndpoint, RangeRelay, RelayConfig, RelayServer};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

/// # Usage
/// ```bash
/// # Start with default config (range_relay.yaml)
/// range-relay
///
/// # Start with custom config
/// range-relay /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting range relay");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "range_relay.yaml".to_string());

    info!("Loading configuration from: {}", config_path);

    let config = RelayConfig::from_file(&config_path)
        .map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })
        .with_context(|| format!("loading {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Fetch target: {}", config.fetch_target().unwrap_or("off"));
    info!("  - Variables: {} / {}", config.uri_var, config.range_var);
    info!("  - Max retries: {}", config.max_retries);
    info!("  - Max redirects: {}", config.max_redirects);
    info!("  - Size header: {}", config.size_header);
    info!("  - Fetch timeout: {}s", config.fetch_timeout_secs);
    if !config.is_enabled() {
        warn!("No fetch target configured; every request will be declined");
    }

    let listen: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen_address {}", config.listen_address))?;

    let backend = Arc::new(HttpBackend::new(config.fetch_timeout())?);
    let config = Arc::new(config);
    let relay = Arc::new(RangeRelay::new(Arc::clone(&config), backend)?);

    if let Some(metrics_config) = config.metrics_endpoint.as_ref().filter(|m| m.enabled) {
        let addr: SocketAddr = metrics_config
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", metrics_config.address))?;
        let endpoint = MetricsEndpoint::new(relay.metrics_arc(), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    RelayServer::new(relay, listen).start().await?;
    Ok(())
}
