use std::sync::Arc;
use std::time::Duration;

use tokio::signal;

use geoproxy::broker::TokenBroker;
use geoproxy::config::{BasicConfigManager, ConfigManager};
use geoproxy::core::dispatcher::Dispatcher;
use geoproxy::core::referrer::ReferrerValidator;
use geoproxy::core::resource::ResourceTable;
use geoproxy::core::server::ProxyServer;
use geoproxy::forwarder::Forwarder;
use geoproxy::limiter::sqlite_store::SqliteMeterStore;
use geoproxy::limiter::RateLimiter;
use geoproxy::logging::init_tracing;
use geoproxy::ProxyError;

#[tokio::main]
async fn main() -> Result<(), ProxyError> {
    // Load configuration. A parse or validation failure aborts startup
    // with a non-zero exit code.
    let config_manager = Arc::new(BasicConfigManager::new());
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "proxy.json".to_string());
    let config_file_found = std::path::Path::new(&config_path).exists();
    if config_file_found {
        config_manager.load_from_file(&config_path).await?;
    }

    let config = config_manager.get_config().await;
    init_tracing(&config.logging);

    if config_file_found {
        tracing::info!("Configuration loaded from {}", config_path);
    } else {
        tracing::warn!(
            "Configuration file {} not found, using default configuration",
            config_path
        );
        // Save the default configuration to file for reference
        if let Err(e) = config_manager.save_to_file(&config_path).await {
            tracing::warn!("Failed to save default configuration to {}: {}", config_path, e);
        } else {
            tracing::info!("Default configuration saved to {}", config_path);
        }
    }

    // Resource table and referrer allow-list
    let resources = Arc::new(ResourceTable::from_definitions(&config.resources)?);
    let referrers = ReferrerValidator::from_allowed(&config.proxy.allowed_referrers);
    tracing::info!(
        "Loaded {} resources, {} referrer patterns",
        resources.len(),
        referrers.keys().len()
    );

    // Durable meter store, preallocated with the Cartesian product of
    // rate-limited resources and referrer keys
    let store = Arc::new(SqliteMeterStore::open(&config.proxy.meter_db_path)?);
    let limiter = RateLimiter::new(store);
    limiter.initialize(&resources, &referrers.keys()).await?;

    // One shared upstream client with the configured timeout
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.proxy.upstream_timeout_secs))
        .build()
        .map_err(|e| ProxyError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
    let broker = Arc::new(TokenBroker::new(client.clone()));
    let forwarder = Forwarder::new(client, broker, config.proxy.inspect_cap_bytes);

    let dispatcher = Arc::new(Dispatcher::new(
        config.proxy.clone(),
        resources,
        referrers,
        limiter,
        forwarder,
    ));

    // Start the listener
    let server = ProxyServer::new(config.server.clone(), dispatcher);
    server.start().await?;
    tracing::info!(
        "Proxy listening on {}:{}",
        config.server.host,
        config.server.port
    );

    // Wait for Ctrl+C
    signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping proxy");

    server.stop().await?;
    tracing::info!("Proxy stopped successfully");

    Ok(())
}
