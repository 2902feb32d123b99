use async_trait::async_trait;
use parking_lot::RwLock;

use super::{validate, CandleIndex, CandleStore, InsertOutcome, StoreError};
use crate::types::Candle;

/// Volatile store backed by an ordered map. Selected with `CANDLE_STORE=memory`;
/// candles are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCandleStore {
    index: RwLock<CandleIndex>,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn insert_one(&self, candle: &Candle) -> Result<InsertOutcome, StoreError> {
        validate(candle)?;
        if self.index.write().insert(candle.clone()) {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::Duplicate)
        }
    }

    async fn find_earliest(&self, symbol: &str, since: i64) -> Result<Option<Candle>, StoreError> {
        Ok(self.index.read().earliest(symbol, since))
    }

    async fn find_range(&self, symbol: &str, since: i64) -> Result<Vec<Candle>, StoreError> {
        Ok(self.index.read().range(symbol, since))
    }

    async fn find_latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError> {
        Ok(self.index.read().latest(symbol, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BatchReport;

    fn candle(bucket_start: i64, close: f64) -> Candle {
        Candle {
            symbol: "BTCUSDT".into(),
            bucket_start,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2.0,
        }
    }

    #[tokio::test]
    async fn insert_one_twice_keeps_one_record() {
        let store = MemoryCandleStore::new();
        assert!(store.is_empty());
        let c = candle(60_000, 100.0);
        assert_eq!(store.insert_one(&c).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_one(&c).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
        assert_eq!(store.find_range("BTCUSDT", 0).await.unwrap(), vec![c]);
    }

    #[tokio::test]
    async fn insert_many_skips_duplicates_without_error() {
        let store = MemoryCandleStore::new();
        store.insert_one(&candle(0, 1.0)).await.unwrap();

        let batch = vec![candle(0, 1.0), candle(60_000, 2.0), candle(60_000, 2.0)];
        let report = store.insert_many(&batch).await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                inserted: 1,
                duplicates: 2
            }
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn insert_many_keeps_good_rows_when_one_fails() {
        let store = MemoryCandleStore::new();
        let mut bad = candle(60_000, 5.0);
        bad.low = 10.0;
        let batch = vec![candle(0, 1.0), bad, candle(120_000, 3.0)];

        match store.insert_many(&batch).await {
            Err(StoreError::Batch { report, failures }) => {
                assert_eq!(report.inserted, 2);
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0], StoreError::InvalidCandle { bucket_start: 60_000, .. }));
            }
            other => panic!("expected batch error, got {other:?}"),
        }
        let starts: Vec<i64> = store
            .find_range("BTCUSDT", 0)
            .await
            .unwrap()
            .iter()
            .map(|c| c.bucket_start)
            .collect();
        assert_eq!(starts, vec![0, 120_000]);
    }

    #[tokio::test]
    async fn find_earliest_honours_lower_bound() {
        let store = MemoryCandleStore::new();
        for i in 0..3 {
            store.insert_one(&candle(i * 60_000, 10.0)).await.unwrap();
        }
        let earliest = store.find_earliest("BTCUSDT", 30_000).await.unwrap();
        assert_eq!(earliest.map(|c| c.bucket_start), Some(60_000));
        assert!(store.find_earliest("BTCUSDT", 500_000).await.unwrap().is_none());
    }
}
