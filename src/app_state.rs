// =============================================================================
// Central Application State - candle recorder control surface
// =============================================================================
//
// Ties the store, the live fan-out, backfill, and the session controller
// together and exposes the operations the API layer calls. Every component
// manages its own interior mutability; AppState only holds `Arc`s to them.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::backfill::{BackfillService, HistorySource};
use crate::broadcaster::Broadcaster;
use crate::market_data::TradeFeed;
use crate::runtime_config::RuntimeConfig;
use crate::storage::CandleStore;
use crate::stream_controller::{SessionError, StreamController};
use crate::types::{Candle, LatestPrice, SessionStatus};

// =============================================================================
// Read-model types
// =============================================================================

/// The newest candles of one symbol.
#[derive(Debug, Clone, Serialize)]
pub struct SymbolCandles {
    pub symbol: String,
    pub candles: Vec<Candle>,
}

/// Aggregates over a symbol's stored candles in a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub count: usize,
    pub avg_close: f64,
    pub high: f64,
    pub low: f64,
    pub total_volume: f64,
}

impl SymbolStats {
    /// `None` when there are no candles to summarise.
    fn from_candles(symbol: &str, candles: &[Candle]) -> Option<Self> {
        let first = candles.first()?;
        let mut stats = Self {
            symbol: symbol.to_string(),
            count: 0,
            avg_close: 0.0,
            high: first.high,
            low: first.low,
            total_volume: 0.0,
        };
        let mut close_sum = 0.0;
        for c in candles {
            stats.count += 1;
            close_sum += c.close;
            stats.high = stats.high.max(c.high);
            stats.low = stats.low.min(c.low);
            stats.total_volume += c.volume;
        }
        stats.avg_close = close_sum / stats.count as f64;
        Some(stats)
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all request handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<dyn CandleStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub backfill: BackfillService,
    pub controller: StreamController,

    /// Instant when the recorder was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        feed: Arc<dyn TradeFeed>,
        history: Arc<dyn HistorySource>,
        store: Arc<dyn CandleStore>,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(config.broadcast_capacity));
        let backfill = BackfillService::new(history, store.clone(), config.page_size);
        let controller = StreamController::new(feed, store.clone(), broadcaster.clone());

        info!(
            symbols = config.symbols.len(),
            page_size = config.page_size,
            broadcast_capacity = config.broadcast_capacity,
            "application state initialised"
        );

        Self {
            config,
            store,
            broadcaster,
            backfill,
            controller,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Session control ─────────────────────────────────────────────────

    pub async fn start_session(&self) -> Result<(), SessionError> {
        self.controller.start().await
    }

    /// Returns the number of open candles flushed.
    pub async fn stop_session(&self) -> Result<usize, SessionError> {
        self.controller.stop().await
    }

    pub fn session_status(&self) -> SessionStatus {
        self.controller.status()
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Every candle for `symbol` since `since_ms`, backfilling the head of
    /// the window first if stored history does not reach it.
    pub async fn query_range(&self, symbol: &str, since_ms: i64) -> Result<Vec<Candle>> {
        let symbol = symbol.trim().to_uppercase();
        let now_ms = Utc::now().timestamp_millis();
        self.backfill.query_range(&symbol, since_ms, now_ms).await
    }

    pub fn latest_prices(&self) -> Vec<LatestPrice> {
        self.broadcaster.latest_prices()
    }

    pub fn latest_price(&self, symbol: &str) -> Option<LatestPrice> {
        self.broadcaster.latest_price(&symbol.trim().to_uppercase())
    }

    /// The newest `limit` stored candles of every configured symbol.
    pub async fn recent_candles(&self, limit: usize) -> Result<Vec<SymbolCandles>> {
        let mut out = Vec::with_capacity(self.config.symbols.len());
        for symbol in &self.config.symbols {
            let candles = self
                .store
                .find_latest(symbol, limit)
                .await
                .with_context(|| format!("failed to read recent candles for {symbol}"))?;
            out.push(SymbolCandles {
                symbol: symbol.clone(),
                candles,
            });
        }
        Ok(out)
    }

    /// Per-symbol aggregates since `since_ms`. Symbols with no stored candles
    /// in the window are left out.
    pub async fn symbol_stats(&self, since_ms: i64) -> Result<Vec<SymbolStats>> {
        let mut out = Vec::new();
        for symbol in &self.config.symbols {
            let candles = self
                .store
                .find_range(symbol, since_ms)
                .await
                .with_context(|| format!("failed to read candles for {symbol}"))?;
            if let Some(stats) = SymbolStats::from_candles(symbol, &candles) {
                out.push(stats);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{FeedEvent, FeedHandle};
    use crate::storage::MemoryCandleStore;
    use crate::types::{minute_bucket, MINUTE_MS};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Feed whose every open hands back a fresh channel; the sender is kept
    /// so the session stays up until stopped.
    #[derive(Default)]
    struct IdleFeed {
        senders: parking_lot::Mutex<Vec<mpsc::Sender<FeedEvent>>>,
    }

    #[async_trait]
    impl TradeFeed for IdleFeed {
        async fn open(&self) -> Result<FeedHandle> {
            let (tx, rx) = mpsc::channel(8);
            self.senders.lock().push(tx);
            Ok(FeedHandle::from_channel(rx))
        }
    }

    /// Generates one bar per minute for whatever window is asked for.
    struct SyntheticHistory;

    #[async_trait]
    impl HistorySource for SyntheticHistory {
        async fn fetch_minute_bars(
            &self,
            symbol: &str,
            start_ms: i64,
            end_ms: i64,
            limit: u32,
        ) -> Result<Vec<Candle>> {
            let first = minute_bucket(start_ms + MINUTE_MS - 1);
            Ok((0..limit as i64)
                .map(|i| first + i * MINUTE_MS)
                .take_while(|t| *t < end_ms)
                .map(|t| candle(symbol, t, 10.0, 1.0))
                .collect())
        }
    }

    fn candle(symbol: &str, bucket_start: i64, close: f64, volume: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            bucket_start,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume,
        }
    }

    fn state(symbols: &[&str]) -> (AppState, Arc<MemoryCandleStore>) {
        let config = RuntimeConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            ..RuntimeConfig::default()
        };
        let store = Arc::new(MemoryCandleStore::new());
        let app = AppState::new(
            config,
            Arc::new(IdleFeed::default()),
            Arc::new(SyntheticHistory),
            store.clone(),
        );
        (app, store)
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (app, _) = state(&["BTCUSDT"]);
        assert_eq!(app.session_status(), SessionStatus::Stopped);
        app.start_session().await.unwrap();
        assert!(matches!(app.start_session().await, Err(SessionError::AlreadyRunning)));
        assert_eq!(app.stop_session().await.unwrap(), 0);
        assert!(matches!(app.stop_session().await, Err(SessionError::NotRunning)));
    }

    #[tokio::test]
    async fn query_range_backfills_missing_history() {
        let (app, store) = state(&["BTCUSDT"]);
        let since = Utc::now().timestamp_millis() - 30 * MINUTE_MS;

        let rows = app.query_range("btcusdt", since).await.unwrap();
        assert!(rows.len() >= 29);
        assert!(rows.iter().all(|c| c.bucket_start >= since && c.symbol == "BTCUSDT"));
        assert!(rows.windows(2).all(|w| w[1].bucket_start - w[0].bucket_start == MINUTE_MS));
        assert_eq!(store.len(), rows.len());
    }

    #[tokio::test]
    async fn recent_candles_cover_each_symbol() {
        let (app, store) = state(&["BTCUSDT", "ETHUSDT"]);
        for m in 0..20 {
            store.insert_one(&candle("BTCUSDT", m * MINUTE_MS, 10.0, 1.0)).await.unwrap();
        }

        let recent = app.recent_candles(15).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].symbol, "BTCUSDT");
        assert_eq!(recent[0].candles.len(), 15);
        assert_eq!(recent[0].candles[0].bucket_start, 5 * MINUTE_MS);
        assert!(recent[1].candles.is_empty());
    }

    #[tokio::test]
    async fn stats_summarise_the_window() {
        let (app, store) = state(&["BTCUSDT", "ETHUSDT"]);
        store.insert_one(&candle("BTCUSDT", 0, 100.0, 1.0)).await.unwrap();
        store.insert_one(&candle("BTCUSDT", MINUTE_MS, 110.0, 2.0)).await.unwrap();
        store.insert_one(&candle("BTCUSDT", 2 * MINUTE_MS, 120.0, 3.0)).await.unwrap();

        let stats = app.symbol_stats(MINUTE_MS).await.unwrap();
        assert_eq!(
            stats,
            vec![SymbolStats {
                symbol: "BTCUSDT".into(),
                count: 2,
                avg_close: 115.0,
                high: 121.0,
                low: 109.0,
                total_volume: 5.0,
            }]
        );
    }
}
