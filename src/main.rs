use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

mod error;
mod handlers;
mod models;
mod services;
mod utils;

use handlers::create_app;
use models::config::{AppConfig, StorageBackend};
use services::executor::Executor;
use services::poller::Poller;
use services::ssh::SshConnector;
use services::store::{CredentialStore, JsonFileStore, MemoryStore};
use utils::logging::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the log settings apply
    let (config, config_error) = match AppConfig::load() {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    let _log_guard = init_logging(&config.logging)?;
    info!("Starting SSH server dashboard v{}", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!("Invalid configuration, using defaults: {}", e);
    }

    let store: Arc<dyn CredentialStore> = match config.storage.backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; servers are lost on restart");
            Arc::new(MemoryStore::new())
        }
        StorageBackend::File => Arc::new(JsonFileStore::open(&config.storage.path).await?),
    };

    let monitoring = &config.monitoring;
    let connector = SshConnector::new(monitoring.connect_timeout(), monitoring.session_timeout());
    let executor = Arc::new(Executor::new(Arc::new(connector)));
    let poller = Arc::new(Poller::new(
        Arc::clone(&store),
        Arc::clone(&executor),
        monitoring.warning_threshold_percent,
    ));

    // Start background polling task
    tokio::spawn(Arc::clone(&poller).run(monitoring.poll_interval()));

    // Create and run the web server
    let app = create_app(store, poller, executor);

    let addr = config.http.socket_addr();
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
