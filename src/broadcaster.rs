// =============================================================================
// Broadcaster - best-effort live fan-out and the latest-price view
// =============================================================================
//
// Built on a tokio broadcast channel: subscribers see only events sent after
// they subscribed, a slow subscriber that falls behind loses the oldest
// events, and a dropped subscriber never affects the others.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{LatestPrice, TradeEvent};

/// Event pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Trade(TradeEvent),
    /// The upstream feed was lost and the session stopped.
    FeedDown { reason: String },
    /// A closed candle could not be persisted and the session stopped.
    StoreDown { reason: String },
}

pub struct Broadcaster {
    tx: broadcast::Sender<LiveEvent>,
    latest: RwLock<HashMap<String, LatestPrice>>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Record the trade as the symbol's latest price and push it to every
    /// current subscriber. Returns how many subscribers it was queued for.
    pub fn on_trade(&self, trade: &TradeEvent) -> usize {
        self.latest.write().insert(
            trade.symbol.clone(),
            LatestPrice {
                symbol: trade.symbol.clone(),
                price: trade.price,
                volume: trade.volume,
                timestamp_ms: trade.trade_time_ms,
            },
        );
        self.publish(LiveEvent::Trade(trade.clone()))
    }

    pub fn notify_feed_down(&self, reason: &str) -> usize {
        self.publish(LiveEvent::FeedDown {
            reason: reason.to_string(),
        })
    }

    pub fn notify_store_down(&self, reason: &str) -> usize {
        self.publish(LiveEvent::StoreDown {
            reason: reason.to_string(),
        })
    }

    fn publish(&self, event: LiveEvent) -> usize {
        // No receivers is the normal idle case, not an error.
        self.tx.send(event).unwrap_or_else(|_| {
            debug!("no live subscribers");
            0
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Latest price per symbol, sorted by symbol.
    pub fn latest_prices(&self) -> Vec<LatestPrice> {
        let mut prices: Vec<LatestPrice> = self.latest.read().values().cloned().collect();
        prices.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        prices
    }

    pub fn latest_price(&self, symbol: &str) -> Option<LatestPrice> {
        self.latest.read().get(symbol).cloned()
    }
}
