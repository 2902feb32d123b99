// =============================================================================
// Candle Recorder - Main Entry Point
// =============================================================================
//
// The recorder starts idle: the trade stream is opened only when a client
// calls `POST /api/v1/stream/start`. Range queries work without a session and
// backfill from the REST history endpoint as needed.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod backfill;
mod binance;
mod broadcaster;
mod market_data;
mod runtime_config;
mod storage;
mod stream_controller;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::market_data::BinanceTradeFeed;
use crate::runtime_config::{RuntimeConfig, StoreKind};
use crate::storage::{CandleStore, JsonlCandleStore, MemoryCandleStore};
use crate::types::SessionStatus;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Recorder starting up");

    let mut config = match RuntimeConfig::load(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let defaults = RuntimeConfig::default();
            if !std::path::Path::new(CONFIG_PATH).exists() {
                if let Err(e) = defaults.save(CONFIG_PATH) {
                    warn!(error = %e, "Failed to write default config");
                }
            }
            defaults
        }
    };
    config
        .apply_env()
        .context("invalid environment override")?;

    if config.symbols.is_empty() {
        anyhow::bail!("no symbols configured");
    }

    info!(symbols = ?config.symbols, "Configured symbols");
    info!(
        ws = %config.ws_base,
        rest = %config.rest_base,
        store = ?config.store,
        "Upstream endpoints"
    );

    // ── 2. Storage ───────────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = match config.store {
        StoreKind::Jsonl => {
            let store = JsonlCandleStore::open(&config.data_path)
                .await
                .with_context(|| {
                    format!("failed to open candle store {}", config.data_path.display())
                })?;
            if store.is_empty() {
                info!(path = %store.path().display(), "Candle store is empty; history will be backfilled on demand");
            } else {
                info!(path = %store.path().display(), candles = store.len(), "Candle store ready");
            }
            Arc::new(store)
        }
        StoreKind::Memory => {
            warn!("Using in-memory candle store; candles are lost on exit");
            Arc::new(MemoryCandleStore::new())
        }
    };

    // ── 3. Upstream clients ──────────────────────────────────────────────
    let history = Arc::new(BinanceClient::new(config.rest_base.clone())?);
    let feed = Arc::new(BinanceTradeFeed::new(
        &config.ws_base,
        &config.symbols,
        config.feed_channel_capacity,
    ));
    info!(url = %feed.url(), "Trade stream configured");

    // ── 4. Build shared state ────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, feed, history, store));

    // ── 5. Start the API server ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::rest::router(state.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("Ready. POST /api/v1/stream/start to begin recording. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received, stopping gracefully");

    if state.session_status() == SessionStatus::Running {
        match state.stop_session().await {
            Ok(flushed) => info!(flushed, "Open candles flushed"),
            Err(e) => error!(error = %e, "Failed to stop streaming session cleanly"),
        }
    }

    info!("Candle Recorder shut down complete.");
    Ok(())
}
