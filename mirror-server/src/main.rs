//! Magic Mirror webhook receiver - HTTP entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use mirror_core::{Config, GitHubClient, Store};
use mirror_server::webhook::webhook_router;
use mirror_server::AppState;

/// Liveness probe.
async fn status_handler() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level.tracing_level())
        .init();

    info!("Starting Magic Mirror webhook receiver");
    info!("Using state database: {}", config.db_path.display());
    if config.webhook_secret.is_none() {
        warn!("webhookSecret is not configured; deliveries will not be verified");
    }

    let store = Store::open(&config.db_path).context("Failed to initialize the state database")?;
    let host = GitHubClient::new(config.app_id, config.private_key.clone())?;

    let state = Arc::new(AppState {
        config: Arc::new(config),
        host: Arc::new(host),
        store: Arc::new(store),
    });

    let app = Router::new()
        .route("/status", get(status_handler))
        .merge(webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!("Listening on port {port}");

    axum::serve(listener, app).await?;

    Ok(())
}
