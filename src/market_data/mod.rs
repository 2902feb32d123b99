pub mod aggregator;
pub mod trade_stream;

pub use aggregator::{CandleAggregator, TradeOutcome};
pub use trade_stream::{BinanceTradeFeed, FeedEvent, FeedHandle, TradeFeed};
