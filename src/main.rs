//! telemetry-relay server entry point.
//!
//! Connects to the broker, starts telemetry ingestion and serves the REST
//! and WebSocket endpoints until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use telemetry_relay::api;
use telemetry_relay::app_state::AppState;
use telemetry_relay::config::RelayConfig;
use telemetry_relay::ingest::TelemetryIngestor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RelayConfig::from_env().context("loading configuration")?;
    tracing::info!(addr = %config.listen_addr, broker = ?config.broker, "starting telemetry-relay");

    let state = AppState::from_config(&config);

    if config.ingest_enabled {
        let ingestor = Arc::new(TelemetryIngestor::new(
            state.broadcaster.clone(),
            Arc::clone(&state.radar_cache),
        ));
        ingestor
            .start(state.broker.as_ref())
            .await
            .context("subscribing to telemetry topics")?;
    }

    let app = api::build_app(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// Installs the global subscriber: `RUST_LOG` filter (default `info`),
/// JSON output when `LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
