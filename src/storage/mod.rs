// =============================================================================
// Candle Store - idempotent persistence and range queries
// =============================================================================
//
// `(symbol, bucket_start)` is the only identity key. Writing a candle whose
// key already exists is not an error: the store keeps the first record and
// reports `InsertOutcome::Duplicate`. Every other failure propagates.
// =============================================================================

pub mod jsonl;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::types::Candle;

pub use jsonl::JsonlCandleStore;
pub use memory::MemoryCandleStore;

// ---------------------------------------------------------------------------
// Outcomes & errors
// ---------------------------------------------------------------------------

/// Result of a single accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A candle with the same `(symbol, bucket_start)` was already stored.
    Duplicate,
}

/// Per-batch counters for `insert_many`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: usize,
    pub duplicates: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("candle {symbol}@{bucket_start} violates OHLC invariants")]
    InvalidCandle { symbol: String, bucket_start: i64 },

    #[error("candle store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode candle: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Some rows of an unordered batch failed. Rows counted in `report`
    /// were written and stay written.
    #[error(
        "{} candle(s) failed in batch ({} inserted, {} duplicates)",
        .failures.len(),
        .report.inserted,
        .report.duplicates
    )]
    Batch {
        report: BatchReport,
        failures: Vec<StoreError>,
    },
}

fn validate(candle: &Candle) -> Result<(), StoreError> {
    if candle.is_consistent() {
        Ok(())
    } else {
        Err(StoreError::InvalidCandle {
            symbol: candle.symbol.clone(),
            bucket_start: candle.bucket_start,
        })
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Durable candle persistence shared by the aggregator, backfill, and the
/// read path.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Persist one candle. Duplicates are reported, never raised.
    async fn insert_one(&self, candle: &Candle) -> Result<InsertOutcome, StoreError>;

    /// Unordered bulk insert. Each row is attempted on its own; failures are
    /// collected and returned together once the whole batch has been tried.
    async fn insert_many(&self, candles: &[Candle]) -> Result<BatchReport, StoreError> {
        let mut report = BatchReport::default();
        let mut failures = Vec::new();
        for candle in candles {
            match self.insert_one(candle).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => failures.push(e),
            }
        }
        if failures.is_empty() {
            Ok(report)
        } else {
            Err(StoreError::Batch { report, failures })
        }
    }

    /// Earliest candle for `symbol` with `bucket_start >= since`.
    async fn find_earliest(&self, symbol: &str, since: i64) -> Result<Option<Candle>, StoreError>;

    /// All candles for `symbol` with `bucket_start >= since`, ascending.
    async fn find_range(&self, symbol: &str, since: i64) -> Result<Vec<Candle>, StoreError>;

    /// The newest `limit` candles for `symbol`, ascending.
    async fn find_latest(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>, StoreError>;
}

// ---------------------------------------------------------------------------
// Ordered in-memory index shared by both implementations
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct CandleIndex {
    rows: BTreeMap<(String, i64), Candle>,
}

impl CandleIndex {
    pub(crate) fn contains(&self, candle: &Candle) -> bool {
        self.rows
            .contains_key(&(candle.symbol.clone(), candle.bucket_start))
    }

    /// Insert unless the key exists. Returns `true` when the row was added.
    pub(crate) fn insert(&mut self, candle: Candle) -> bool {
        let key = (candle.symbol.clone(), candle.bucket_start);
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, candle);
        true
    }

    fn symbol_range<'a>(
        &'a self,
        symbol: &str,
        since: i64,
    ) -> impl DoubleEndedIterator<Item = &'a Candle> + 'a {
        let lo = (symbol.to_string(), since);
        let hi = (symbol.to_string(), i64::MAX);
        self.rows.range(lo..=hi).map(|(_, c)| c)
    }

    pub(crate) fn earliest(&self, symbol: &str, since: i64) -> Option<Candle> {
        self.symbol_range(symbol, since).next().cloned()
    }

    pub(crate) fn range(&self, symbol: &str, since: i64) -> Vec<Candle> {
        self.symbol_range(symbol, since).cloned().collect()
    }

    pub(crate) fn latest(&self, symbol: &str, limit: usize) -> Vec<Candle> {
        let mut newest: Vec<Candle> = self
            .symbol_range(symbol, i64::MIN)
            .rev()
            .take(limit)
            .cloned()
            .collect();
        newest.reverse();
        newest
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
