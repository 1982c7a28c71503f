// Declare the modules
pub mod aggregator;
pub mod api;
pub mod chat;
pub mod config;
pub mod content;
pub mod error;
pub mod handlers;
pub mod models;
pub mod registry;
pub mod state;
pub mod storage;
pub mod title;

use anyhow::Context;
use api::Adapters;
use config::ServerConfig;
use registry::ProviderRegistry;
use state::AppState;
use storage::StorageManager;

/// Loads configuration and storage, then serves the HTTP API until shutdown.
pub async fn serve() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    let storage = StorageManager::connect(&config.database_url).await?;
    // Add default provider if none exist
    storage.add_default_provider_if_none().await?;

    let registry = ProviderRegistry::load(&storage)
        .await
        .context("Failed to load provider registry")?;
    let app_state = AppState::new(storage, registry, Adapters::http(), config.sse_buffer);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    log::info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, handlers::router(app_state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
        })
        .await
        .context("Server error")
}

pub fn run() {
    // Initialize logging
    env_logger::init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve()) {
        log::error!("flai exited with error: {:#}", e);
        std::process::exit(1);
    }
}
