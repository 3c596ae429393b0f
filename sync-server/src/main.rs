//! sync-server binary entry point.
//!
//! Usage:
//! ```bash
//! oplog-sync-server --config oplog.toml
//! ```

use oplog_sync_server::config::Config;
use oplog_sync_server::http;
use oplog_sync_server::retention::spawn_retention_task;
use oplog_sync_server::server::SyncServer;
use oplog_sync_server::storage::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        tracing::warn!(path = %config_path.display(), "config file not found, using defaults");
        Config::default()
    };

    let store = SqliteStore::new(&config.storage.database).await?;
    tracing::info!(database = %config.storage.database.display(), "storage ready");

    let bind_address = config.server.bind_address.clone();
    let retention_config = config.retention.clone();
    let server = Arc::new(SyncServer::new(config, store));

    let _retention = spawn_retention_task(
        server.compactor(),
        server.limits(),
        server.dedup(),
        retention_config,
    );

    http::health::init_start_time();
    let router = http::build_router(server);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(%bind_address, "sync server listening");
    axum::serve(listener, router).await?;

    Ok(())
}

fn config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("oplog.toml"))
}
