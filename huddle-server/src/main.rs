use std::sync::Arc;

use huddle_collab::{
    CollabServer, FileStore, MemoryFileStore, RocksFileStore, ServerConfig, StaticDirectory,
    StoreConfig,
};
use log::{error, info, warn};
use tokio::signal;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    info!("Starting Huddle collaboration server v{}", env!("CARGO_PKG_VERSION"));

    let directory = match &config.directory_path {
        Some(path) => match StaticDirectory::load(path) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                error!("Failed to load directory: {e}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("No HUDDLE_DIRECTORY set; every connection will be rejected");
            Arc::new(StaticDirectory::new())
        }
    };

    let store: Arc<dyn FileStore> = match &config.storage_path {
        Some(path) => match RocksFileStore::open(StoreConfig {
            path: path.clone(),
            ..StoreConfig::default()
        }) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                error!("Failed to open file store at {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            info!("No HUDDLE_STORAGE_PATH set; file content is kept in memory");
            Arc::new(MemoryFileStore::new())
        }
    };

    let server = CollabServer::new(config, directory.clone(), directory, store);
    let hub = server.hub().clone();

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, saving open documents");
            let written = hub.flush_dirty().await;
            info!("Saved {written} documents");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {e}");
        std::future::pending::<()>().await;
    }
}
