//! Playlist distribution and seeding lifecycle manager
//!
//! Stages playlists into content roots, bundles them, keeps one transfer
//! session per playlist and lets listening activity decide what stays
//! seeded.

use std::sync::Arc;
use tracing::{error, info};

pub mod bundle;
pub mod config;
pub mod error;
pub mod layout;
pub mod policy;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod sidecar;
pub mod staging;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use layout::Layout;
pub use policy::{PolicyReport, SeedingPolicy, RETENTION_WINDOW_DAYS};
pub use service::PlaylistService;
pub use session::{SessionManager, StartOutcome};
pub use store::{JsonFileStore, MemoryStore, PlaylistStore};

fn open_store(config: &Config) -> Result<Arc<JsonFileStore>> {
    let layout = Layout::new(&config.data_root);
    std::fs::create_dir_all(layout.root())?;
    Ok(Arc::new(JsonFileStore::open(layout.store_path())?))
}

/// Open the default store and engine for `config`
pub fn open_service(config: &Config) -> Result<PlaylistService> {
    let store = open_store(config)?;
    let engine = Arc::new(engine::DiskEngine::new(config.engine_options()));
    Ok(PlaylistService::new(config, engine, store))
}

/// Open the store without an engine, for commands that run next to a
/// serving process
pub fn open_detached_service(config: &Config) -> Result<PlaylistService> {
    Ok(PlaylistService::detached(config, open_store(config)?))
}

/// Run the maintenance loop until ctrl-c: enforce retention and pick up
/// sidecar metadata on every tick.
pub async fn run(config: Config) -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();
    info!("Starting Tapeswarm with data root {}", config.data_root.display());

    let service = open_service(&config)?;
    let report = service.enforce_policy().await?;
    info!(
        "Startup policy pass: {} started, {} failed",
        report.started.len(),
        report.failed.len()
    );

    let mut ticker = tokio::time::interval(config.policy_interval());
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = service.refresh_all_metadata().await {
                    error!("Metadata refresh failed: {}", e);
                }
                if let Err(e) = service.enforce_policy().await {
                    error!("Policy pass failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    service.shutdown();
    Ok(())
}
