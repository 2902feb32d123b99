// =============================================================================
// Backfill - fill historical gaps from a paginated minute-bar source
// =============================================================================
//
// One window is fetched strictly page by page: each page is persisted before
// the next request is made, so an error part-way leaves every earlier page
// stored. Store writes are idempotent, which makes re-running a window safe.
//
// Gap detection only looks at the head of the window. A hole in the middle of
// already-stored history is not found.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::storage::CandleStore;
use crate::types::{Candle, DAY_MS, MINUTE_MS};

/// Largest page the klines endpoint serves.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// A paginated source of closed one-minute bars.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Up to `limit` bars for `symbol` starting at or after `start_ms`,
    /// ascending. Bars at or after `end_ms` may be included.
    async fn fetch_minute_bars(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
        limit: u32,
    ) -> Result<Vec<Candle>>;
}

/// Counters for one backfilled window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub symbol: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub pages: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

pub struct BackfillService {
    source: Arc<dyn HistorySource>,
    store: Arc<dyn CandleStore>,
    page_size: u32,
}

impl BackfillService {
    pub fn new(source: Arc<dyn HistorySource>, store: Arc<dyn CandleStore>, page_size: u32) -> Self {
        Self {
            source,
            store,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Fetch and persist every bar in `[start_ms, end_ms)`.
    pub async fn backfill(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<BackfillReport> {
        let mut report = BackfillReport {
            symbol: symbol.to_string(),
            start_ms,
            end_ms,
            ..Default::default()
        };

        info!(symbol, start_ms, end_ms, "backfill started");

        let mut cursor = start_ms;
        while cursor < end_ms {
            let bars = self
                .source
                .fetch_minute_bars(symbol, cursor, end_ms, self.page_size)
                .await
                .with_context(|| format!("history fetch failed for {symbol} at {cursor}"))?;

            let Some(last_open) = bars.iter().map(|c| c.bucket_start).max() else {
                debug!(symbol, cursor, "empty history page, window exhausted");
                break;
            };

            report.pages += 1;
            report.fetched += bars.len();

            let in_window: Vec<Candle> = bars
                .into_iter()
                .filter(|c| c.bucket_start < end_ms)
                .collect();

            if !in_window.is_empty() {
                let batch = self
                    .store
                    .insert_many(&in_window)
                    .await
                    .with_context(|| format!("failed to persist history page for {symbol}"))?;
                report.inserted += batch.inserted;
                report.duplicates += batch.duplicates;
                debug!(
                    symbol,
                    cursor,
                    rows = in_window.len(),
                    inserted = batch.inserted,
                    duplicates = batch.duplicates,
                    "history page stored"
                );
            }

            let next = last_open + MINUTE_MS;
            if next <= cursor {
                warn!(symbol, cursor, last_open, "history source did not advance; stopping");
                break;
            }
            cursor = next;
        }

        info!(
            symbol,
            pages = report.pages,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "backfill finished"
        );
        Ok(report)
    }

    /// Backfill the head of `[start_ms, now_ms)` if stored history does not
    /// reach back to within a day of `start_ms`. Returns `None` when nothing
    /// needed fetching.
    pub async fn fill_gaps(
        &self,
        symbol: &str,
        start_ms: i64,
        now_ms: i64,
    ) -> Result<Option<BackfillReport>> {
        let earliest = self
            .store
            .find_earliest(symbol, start_ms)
            .await
            .with_context(|| format!("failed to look up earliest candle for {symbol}"))?;

        let gap_end = match earliest {
            None => now_ms,
            Some(c) if c.bucket_start > start_ms + DAY_MS => c.bucket_start,
            Some(_) => {
                debug!(symbol, start_ms, "stored history covers window head");
                return Ok(None);
            }
        };

        self.backfill(symbol, start_ms, gap_end).await.map(Some)
    }

    /// Fill gaps, then return every stored candle since `since_ms`.
    pub async fn query_range(&self, symbol: &str, since_ms: i64, now_ms: i64) -> Result<Vec<Candle>> {
        self.fill_gaps(symbol, since_ms, now_ms).await?;
        self.store
            .find_range(symbol, since_ms)
            .await
            .with_context(|| format!("failed to read candles for {symbol}"))
    }
}
