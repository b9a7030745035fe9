//! Main engine command - starts the watcher, executor worker pool, and
//! scheduler, then blocks until Ctrl+C.

use anyhow::Result;
use tracing::{info, warn};

use update_engine::config::Configuration;
use update_engine::engine::Engine;

/// Runs the engine until interrupted.
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from: {}", config_path);
    let config = match Configuration::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!("could not read {}, falling back to defaults: {}", config_path, e);
            Configuration::default()
        }
    };

    info!("engine_id={} database={}", config.engine_id, config.database_path);
    let engine = Engine::bootstrap(config)?;
    info!("engine started; watcher, executor workers, and cron loop are running");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C handler");
    warn!("received shutdown signal, draining in-flight jobs...");
    engine.shutdown().await;

    info!("engine stopped");
    Ok(())
}
