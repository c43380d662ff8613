// =============================================================================
// Livebar Server — Main Entry Point
// =============================================================================
//
// Streams live OHLCV bars (plain, tick-count and Heikin-Ashi) to WebSocket
// subscribers, fanning one upstream tick feed per symbol out to every
// connection that asked for that symbol.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod market_data;
mod runtime_config;
mod streaming;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Livebar server starting up");

    let mut config = ServerConfig::load("livebar_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServerConfig::default()
    });
    config.apply_env_overrides();
    let config = config.sanitize();

    info!(
        bind_addr = %config.bind_addr,
        upstream = ?config.upstream_url,
        cleanup_secs = config.cleanup_interval_secs,
        "Configuration resolved"
    );

    // ── 2. Build services ────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));
    state.manager.start();

    // ── 3. Serve until ctrl-c ────────────────────────────────────────────
    let app = api::rest::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind_addr))?;
    info!(addr = %state.config.bind_addr, "API server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed");

    // ── 4. Tear down ─────────────────────────────────────────────────────
    state.manager.stop().await;
    info!("Livebar server stopped");

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
