// =============================================================================
// Shared types used across the candle recorder
// =============================================================================

use serde::{Deserialize, Serialize};

/// Width of one candle bucket in milliseconds.
pub const MINUTE_MS: i64 = 60_000;

pub const HOUR_MS: i64 = 60 * MINUTE_MS;

/// One day in milliseconds.
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Start of the one-minute bucket containing `ts_ms`.
///
/// Uses floor division so timestamps before the epoch still land on the
/// minute boundary at or below them.
pub fn minute_bucket(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

/// A closed one-minute OHLCV candle. `(symbol, bucket_start)` is its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Bucket open time, milliseconds since the UNIX epoch (UTC).
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Open a fresh candle from the first trade of a bucket.
    pub fn from_first_trade(trade: &TradeEvent, bucket_start: i64) -> Self {
        Self {
            symbol: trade.symbol.clone(),
            bucket_start,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
        }
    }

    /// Fold another trade of the same bucket into this candle.
    pub fn apply(&mut self, price: f64, volume: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume;
    }

    /// `low <= open, close <= high`, every value finite, volume non-negative.
    pub fn is_consistent(&self) -> bool {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        values.iter().all(|v| v.is_finite())
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
    }
}

/// A single normalized trade from the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub trade_time_ms: i64,
}

/// Most recent trade seen for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPrice {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub timestamp_ms: i64,
}

/// Whether a streaming session is currently routing trades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[default]
    Stopped,
    Running,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: f64, volume: f64) -> TradeEvent {
        TradeEvent {
            symbol: "BTCUSDT".into(),
            price,
            volume,
            trade_time_ms: 0,
        }
    }

    #[test]
    fn minute_bucket_floors_to_minute() {
        assert_eq!(minute_bucket(0), 0);
        assert_eq!(minute_bucket(59_999), 0);
        assert_eq!(minute_bucket(60_000), 60_000);
        assert_eq!(minute_bucket(1_700_000_012_345), 1_699_999_980_000);
        assert_eq!(minute_bucket(-1), -60_000);
    }

    #[test]
    fn apply_tracks_extremes_and_close() {
        let mut c = Candle::from_first_trade(&trade(100.0, 1.0), 0);
        c.apply(105.0, 2.0);
        c.apply(98.0, 0.5);
        c.apply(101.0, 0.5);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 98.0);
        assert_eq!(c.close, 101.0);
        assert!((c.volume - 4.0).abs() < f64::EPSILON);
        assert!(c.is_consistent());
    }

    #[test]
    fn inconsistent_candles_are_detected() {
        let mut c = Candle::from_first_trade(&trade(100.0, 1.0), 0);
        c.high = 90.0;
        assert!(!c.is_consistent());

        let mut c = Candle::from_first_trade(&trade(100.0, 1.0), 0);
        c.volume = f64::NAN;
        assert!(!c.is_consistent());
    }

    #[test]
    fn session_status_defaults_to_stopped() {
        assert_eq!(SessionStatus::default(), SessionStatus::Stopped);
        assert_eq!(SessionStatus::Running.to_string(), "Running");
    }
}
