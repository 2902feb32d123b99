use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::storage::{CandleStore, StoreError};
use crate::types::{minute_bucket, Candle, TradeEvent};

/// What a single trade did to the per-symbol slot.
#[derive(Debug, Clone, PartialEq)]
pub enum TradeOutcome {
    /// First trade for the symbol since the last flush.
    Opened,
    /// Merged into the open bucket.
    Updated,
    /// The previous bucket was persisted and a new one opened.
    Rolled(Candle),
    /// The trade belongs to a bucket older than the open one.
    DroppedLate,
}

// ---------------------------------------------------------------------------
// CandleAggregator -- one in-progress candle per symbol
// ---------------------------------------------------------------------------

/// Folds an ordered trade stream into one-minute candles.
///
/// Holds at most one open candle per symbol. A candle is written to the store
/// only when a trade for a later minute arrives or on [`flush_all`]. The
/// write is awaited before the slot is reused, so the old bucket is durable
/// before it leaves memory.
///
/// [`flush_all`]: CandleAggregator::flush_all
pub struct CandleAggregator {
    store: Arc<dyn CandleStore>,
    open: HashMap<String, Candle>,
}

impl CandleAggregator {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self {
            store,
            open: HashMap::new(),
        }
    }

    /// Apply one trade. If persisting the previous bucket fails, the error is
    /// returned and the slot is left exactly as it was.
    pub async fn on_trade(&mut self, trade: &TradeEvent) -> Result<TradeOutcome, StoreError> {
        let bucket = minute_bucket(trade.trade_time_ms);

        match self.open.entry(trade.symbol.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Candle::from_first_trade(trade, bucket));
                Ok(TradeOutcome::Opened)
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if bucket == current.bucket_start {
                    current.apply(trade.price, trade.volume);
                    Ok(TradeOutcome::Updated)
                } else if bucket < current.bucket_start {
                    debug!(
                        symbol = %trade.symbol,
                        trade_bucket = bucket,
                        open_bucket = current.bucket_start,
                        "dropping late trade"
                    );
                    Ok(TradeOutcome::DroppedLate)
                } else {
                    let closed = current.clone();
                    self.store.insert_one(&closed).await?;
                    debug!(
                        symbol = %closed.symbol,
                        bucket_start = closed.bucket_start,
                        close = closed.close,
                        "candle closed"
                    );
                    *current = Candle::from_first_trade(trade, bucket);
                    Ok(TradeOutcome::Rolled(closed))
                }
            }
        }
    }

    /// Persist every open candle and clear the map. Returns how many candles
    /// were written. On failure the candles not yet written stay in memory.
    pub async fn flush_all(&mut self) -> Result<usize, StoreError> {
        let mut symbols: Vec<String> = self.open.keys().cloned().collect();
        symbols.sort();

        let mut flushed = 0;
        for symbol in symbols {
            if let Some(candle) = self.open.get(&symbol) {
                self.store.insert_one(candle).await?;
            }
            self.open.remove(&symbol);
            flushed += 1;
        }
        Ok(flushed)
    }

    #[cfg(test)]
    pub fn open_candle(&self, symbol: &str) -> Option<&Candle> {
        self.open.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::{InsertOutcome, MemoryCandleStore};

    fn trade(symbol: &str, t_ms: i64, price: f64, volume: f64) -> TradeEvent {
        TradeEvent {
            symbol: symbol.into(),
            price,
            volume,
            trade_time_ms: t_ms,
        }
    }

    /// Store that refuses writes while `fail` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryCandleStore,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CandleStore for FlakyStore {
        async fn insert_one(&self, candle: &Candle) -> Result<InsertOutcome, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk unavailable",
                )));
            }
            self.inner.insert_one(candle).await
        }

        async fn find_earliest(&self, symbol: &str, since: i64) -> Result<Option<Candle>, StoreError> {
            self.inner.find_earliest(symbol, since).await
        }

        async fn find_range(&self, symbol: &str, since: i64) -> Result<Vec<Candle>, StoreError> {
            self.inner.find_range(symbol, since).await
        }

        async fn find_latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
            self.inner.find_latest(symbol, limit).await
        }
    }

    #[tokio::test]
    async fn three_trade_scenario_produces_two_candles() {
        let store = Arc::new(MemoryCandleStore::new());
        let mut agg = CandleAggregator::new(store.clone());

        assert_eq!(agg.on_trade(&trade("X", 0, 100.0, 1.0)).await.unwrap(), TradeOutcome::Opened);
        assert_eq!(
            agg.on_trade(&trade("X", 10_000, 105.0, 2.0)).await.unwrap(),
            TradeOutcome::Updated
        );
        let rolled = agg.on_trade(&trade("X", 70_000, 90.0, 3.0)).await.unwrap();

        let first = Candle {
            symbol: "X".into(),
            bucket_start: 0,
            open: 100.0,
            high: 105.0,
            low: 100.0,
            close: 105.0,
            volume: 3.0,
        };
        assert_eq!(rolled, TradeOutcome::Rolled(first.clone()));
        assert_eq!(store.find_range("X", 0).await.unwrap(), vec![first.clone()]);

        assert_eq!(agg.flush_all().await.unwrap(), 1);
        let second = Candle {
            symbol: "X".into(),
            bucket_start: 60_000,
            open: 90.0,
            high: 90.0,
            low: 90.0,
            close: 90.0,
            volume: 3.0,
        };
        assert_eq!(store.find_range("X", 0).await.unwrap(), vec![first, second]);
        assert_eq!(agg.open_count(), 0);
    }

    #[tokio::test]
    async fn bucket_ohlc_follows_trade_order() {
        let store = Arc::new(MemoryCandleStore::new());
        let mut agg = CandleAggregator::new(store.clone());
        let prices = [50.0, 52.5, 49.0, 51.0, 53.0, 50.5];
        for (i, p) in prices.iter().enumerate() {
            agg.on_trade(&trade("BTCUSDT", 120_000 + i as i64 * 1_000, *p, 0.25))
                .await
                .unwrap();
        }
        agg.flush_all().await.unwrap();

        let stored = store.find_range("BTCUSDT", 0).await.unwrap();
        assert_eq!(stored.len(), 1);
        let c = &stored[0];
        assert_eq!(c.bucket_start, 120_000);
        assert_eq!(c.open, 50.0);
        assert_eq!(c.close, 50.5);
        assert_eq!(c.high, 53.0);
        assert_eq!(c.low, 49.0);
        assert!((c.volume - 1.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn late_trade_is_dropped() {
        let store = Arc::new(MemoryCandleStore::new());
        let mut agg = CandleAggregator::new(store.clone());
        agg.on_trade(&trade("X", 0, 10.0, 1.0)).await.unwrap();
        agg.on_trade(&trade("X", 61_000, 11.0, 1.0)).await.unwrap();

        let outcome = agg.on_trade(&trade("X", 30_000, 1.0, 100.0)).await.unwrap();
        assert_eq!(outcome, TradeOutcome::DroppedLate);

        let open = agg.open_candle("X").unwrap();
        assert_eq!(open.bucket_start, 60_000);
        assert_eq!(open.low, 11.0);
        let stored = store.find_range("X", 0).await.unwrap();
        assert_eq!(stored[0].volume, 1.0);
    }

    #[tokio::test]
    async fn symbols_are_bucketed_independently() {
        let store = Arc::new(MemoryCandleStore::new());
        let mut agg = CandleAggregator::new(store.clone());
        agg.on_trade(&trade("A", 0, 1.0, 1.0)).await.unwrap();
        agg.on_trade(&trade("B", 65_000, 2.0, 1.0)).await.unwrap();
        // B is a minute ahead, but A's slot is untouched.
        assert_eq!(
            agg.on_trade(&trade("A", 5_000, 1.5, 1.0)).await.unwrap(),
            TradeOutcome::Updated
        );
        assert_eq!(store.len(), 0);
        assert_eq!(agg.open_count(), 2);
        assert_eq!(agg.flush_all().await.unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn failed_roll_keeps_previous_bucket_in_memory() {
        let store = Arc::new(FlakyStore::default());
        let mut agg = CandleAggregator::new(store.clone());
        agg.on_trade(&trade("X", 0, 10.0, 1.0)).await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        assert!(agg.on_trade(&trade("X", 60_000, 20.0, 1.0)).await.is_err());
        let open = agg.open_candle("X").unwrap();
        assert_eq!(open.bucket_start, 0);
        assert_eq!(open.close, 10.0);

        assert!(agg.flush_all().await.is_err());
        assert_eq!(agg.open_count(), 1);

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(agg.flush_all().await.unwrap(), 1);
        assert_eq!(store.inner.len(), 1);
    }
}
