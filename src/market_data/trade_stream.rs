// =============================================================================
// Trade Feed Listener - one combined-stream WebSocket for all symbols
// =============================================================================
//
// Raw frames are validated into `TradeEvent`s at this boundary. Anything that
// does not match the expected shape is logged and dropped; it never ends the
// connection. A read error or upstream close ends the reader with a single
// `FeedEvent::Disconnected` and nothing reconnects.
// =============================================================================

use std::ops::ControlFlow;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

use crate::types::TradeEvent;

/// Output of a feed connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Trade(TradeEvent),
    /// The connection is gone. Always the last event of a feed.
    Disconnected { reason: String },
}

// ---------------------------------------------------------------------------
// Feed handle & trait
// ---------------------------------------------------------------------------

/// A live feed connection: the event channel plus the means to close it.
pub struct FeedHandle {
    events: mpsc::Receiver<FeedEvent>,
    closer: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl FeedHandle {
    pub fn new(
        events: mpsc::Receiver<FeedEvent>,
        closer: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            closer: Some(closer),
            task: Some(task),
        }
    }

    /// A handle over a bare channel, with no reader task behind it.
    #[cfg(test)]
    pub fn from_channel(events: mpsc::Receiver<FeedEvent>) -> Self {
        Self {
            events,
            closer: None,
            task: None,
        }
    }

    pub async fn recv(&mut self) -> Option<FeedEvent> {
        self.events.recv().await
    }

    /// Ask the reader to close the socket and wait until it has.
    pub async fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "feed reader task ended abnormally");
            }
        }
    }
}

/// Something that can open a trade feed. The WebSocket implementation is
/// [`BinanceTradeFeed`]; tests substitute an in-memory channel.
#[async_trait]
pub trait TradeFeed: Send + Sync {
    async fn open(&self) -> Result<FeedHandle>;
}

// ---------------------------------------------------------------------------
// Binance combined trade stream
// ---------------------------------------------------------------------------

/// Build the combined-stream URL: `<base>/stream?streams=btcusdt@trade/...`.
pub fn build_stream_url(ws_base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    format!(
        "{}/stream?streams={}",
        ws_base.trim_end_matches('/'),
        streams.join("/")
    )
}

pub struct BinanceTradeFeed {
    url: String,
    channel_capacity: usize,
}

impl BinanceTradeFeed {
    pub fn new(ws_base: &str, symbols: &[String], channel_capacity: usize) -> Self {
        Self {
            url: build_stream_url(ws_base, symbols),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TradeFeed for BinanceTradeFeed {
    async fn open(&self) -> Result<FeedHandle> {
        info!(url = %self.url, "connecting to trade WebSocket");

        let (ws_stream, _response) = connect_async(&self.url)
            .await
            .context("failed to connect to trade WebSocket")?;

        info!("trade WebSocket connected");
        let (mut write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        if let Err(e) = write.send(Message::Close(None)).await {
                            debug!(error = %e, "close frame not delivered");
                        }
                        info!("trade WebSocket closed by request");
                        return;
                    }
                    msg = read.next() => {
                        if forward_frame(msg, &tx).await.is_break() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(FeedHandle::new(rx, close_tx, task))
    }
}

/// Handle one read from the socket. Trades are forwarded, malformed frames
/// are dropped, and the connection ending is reported as `Disconnected`.
/// Breaks when the reader should exit.
async fn forward_frame(
    msg: Option<Result<Message, WsError>>,
    tx: &mpsc::Sender<FeedEvent>,
) -> ControlFlow<()> {
    let reason = match msg {
        Some(Ok(Message::Text(text))) => {
            match parse_trade_message(&text) {
                Ok(Some(trade)) => {
                    if tx.send(FeedEvent::Trade(trade)).await.is_err() {
                        debug!("feed consumer gone; stopping reader");
                        return ControlFlow::Break(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dropping malformed trade message"),
            }
            return ControlFlow::Continue(());
        }
        Some(Ok(Message::Close(frame))) => {
            warn!(frame = ?frame, "trade WebSocket closed by upstream");
            match frame {
                Some(f) => format!("closed by upstream: {} {}", f.code, f.reason),
                None => "closed by upstream".to_string(),
            }
        }
        // tungstenite answers pings itself.
        Some(Ok(_)) => return ControlFlow::Continue(()),
        Some(Err(e)) => {
            error!(error = %e, "trade WebSocket read error");
            e.to_string()
        }
        None => {
            warn!("trade WebSocket stream ended");
            "stream ended".to_string()
        }
    };

    let _ = tx.send(FeedEvent::Disconnected { reason }).await;
    ControlFlow::Break(())
}

// ---------------------------------------------------------------------------
// Message parsing
// ---------------------------------------------------------------------------

/// Trade times with exactly ten decimal digits are in seconds; everything
/// else is taken as milliseconds.
pub fn normalize_trade_time(raw: i64) -> i64 {
    if raw.unsigned_abs().to_string().len() == 10 {
        raw.saturating_mul(1000)
    } else {
        raw
    }
}

/// Parse one combined-stream frame.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@trade",
///   "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.10", "q": "0.5", "T": 1700000000000 } }
/// ```
///
/// Frames without a `data` payload (subscription acks) yield `Ok(None)`.
pub fn parse_trade_message(text: &str) -> Result<Option<TradeEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let data = match root.get("data") {
        Some(d) if !d.is_null() => d,
        _ => return Ok(None),
    };

    let symbol = data["s"]
        .as_str()
        .context("missing field data.s")?
        .trim()
        .to_uppercase();
    if symbol.is_empty() {
        bail!("empty symbol");
    }

    let price = parse_string_f64(&data["p"], "data.p")?;
    let volume = parse_string_f64(&data["q"], "data.q")?;
    if price <= 0.0 {
        bail!("non-positive price {price}");
    }
    if volume < 0.0 {
        bail!("negative quantity {volume}");
    }

    let raw_time = match &data["T"] {
        serde_json::Value::Number(n) => n.as_i64().context("field data.T is not an integer")?,
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse data.T as integer: {s}"))?,
        _ => bail!("missing field data.T"),
    };

    Ok(Some(TradeEvent {
        symbol,
        price,
        volume,
        trade_time_ms: normalize_trade_time(raw_time),
    }))
}

/// Binance sends prices and quantities as JSON strings.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    let parsed = match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        _ => bail!("field {name} has unexpected JSON type"),
    };
    if !parsed.is_finite() {
        bail!("field {name} is not finite");
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(time: &str) -> String {
        format!(
            r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","s":"BTCUSDT","p":"37000.10","q":"0.250","T":{time},"m":true}}}}"#
        )
    }

    #[test]
    fn url_joins_lowercase_trade_streams() {
        let url = build_stream_url(
            "wss://stream.binance.com:9443/",
            &["BTCUSDT".to_string(), "EthUsdt".to_string()],
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[test]
    fn ten_digit_times_are_seconds() {
        assert_eq!(normalize_trade_time(1_700_000_000), 1_700_000_000_000);
        assert_eq!(normalize_trade_time(1_700_000_000_000), 1_700_000_000_000);
        assert_eq!(normalize_trade_time(999_999_999), 999_999_999);
    }

    #[test]
    fn parses_trade_with_millisecond_time() {
        let trade = parse_trade_message(&frame("1700000000000")).unwrap().unwrap();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert!((trade.price - 37000.10).abs() < 1e-9);
        assert!((trade.volume - 0.25).abs() < 1e-12);
        assert_eq!(trade.trade_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn parses_trade_with_second_time() {
        let trade = parse_trade_message(&frame("1700000000")).unwrap().unwrap();
        assert_eq!(trade.trade_time_ms, 1_700_000_000_000);
    }

    #[test]
    fn frames_without_data_are_ignored() {
        assert_eq!(parse_trade_message(r#"{"result":null,"id":1}"#).unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(parse_trade_message("not json").is_err());
        assert!(parse_trade_message(r#"{"data":{"s":"BTCUSDT","p":"abc","q":"1","T":1}}"#).is_err());
        assert!(parse_trade_message(r#"{"data":{"s":"BTCUSDT","p":"1","q":"1"}}"#).is_err());
        assert!(parse_trade_message(r#"{"data":{"p":"1","q":"1","T":1}}"#).is_err());
        assert!(parse_trade_message(r#"{"data":{"s":"BTCUSDT","p":"-1","q":"1","T":1}}"#).is_err());
        assert!(parse_trade_message(r#"{"data":{"s":"BTCUSDT","p":"inf","q":"1","T":1}}"#).is_err());
    }

    #[tokio::test]
    async fn malformed_frames_do_not_end_the_reader() {
        let (tx, mut rx) = mpsc::channel(8);
        let frames = [
            Message::Text("not json".into()),
            Message::Text(frame("1700000000000")),
            Message::Text(r#"{"data":{"s":"BTCUSDT","p":"abc","q":"1","T":1}}"#.into()),
            Message::Ping(vec![1]),
        ];
        for msg in frames {
            assert!(forward_frame(Some(Ok(msg)), &tx).await.is_continue());
        }

        match rx.try_recv() {
            Ok(FeedEvent::Trade(t)) => assert_eq!(t.trade_time_ms, 1_700_000_000_000),
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_end_reports_disconnect_once() {
        let (tx, mut rx) = mpsc::channel(8);
        assert!(forward_frame(None, &tx).await.is_break());
        assert_eq!(
            rx.try_recv().unwrap(),
            FeedEvent::Disconnected {
                reason: "stream ended".into()
            }
        );

        let closed = forward_frame(Some(Ok(Message::Close(None))), &tx).await;
        assert!(closed.is_break());
        assert_eq!(
            rx.try_recv().unwrap(),
            FeedEvent::Disconnected {
                reason: "closed by upstream".into()
            }
        );
    }

    #[tokio::test]
    async fn channel_handle_delivers_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let mut handle = FeedHandle::from_channel(rx);
        for i in 0..3 {
            tx.send(FeedEvent::Trade(TradeEvent {
                symbol: "X".into(),
                price: 1.0 + i as f64,
                volume: 1.0,
                trade_time_ms: i,
            }))
            .await
            .unwrap();
        }
        for i in 0..3 {
            match handle.recv().await {
                Some(FeedEvent::Trade(t)) => assert_eq!(t.trade_time_ms, i),
                other => panic!("unexpected {other:?}"),
            }
        }
        handle.close().await;
        assert!(tx.is_closed());
    }
}
