//! Magic Mirror syncer - polling entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use mirror_core::workspace::GitWorkspace;
use mirror_core::{Config, GitHubClient, Store};
use mirror_syncer::Syncer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.tracing_level())
        .init();

    info!("Starting Magic Mirror syncer");
    info!("Using state database: {}", config.db_path.display());

    let store = Store::open(&config.db_path).context("Failed to initialize the state database")?;
    let host = GitHubClient::new(config.app_id, config.private_key.clone())?;

    let syncer = Syncer::new(
        Arc::new(config),
        Arc::new(host),
        Arc::new(store),
        Arc::new(GitWorkspace),
    );

    syncer.run_forever().await;

    Ok(())
}
