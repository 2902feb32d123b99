// =============================================================================
// Stream Controller - start/stop session state machine
// =============================================================================
//
// States: Stopped (initial) and Running. A session owns one feed connection
// and one pipeline task. The pipeline task is the only place trades are
// aggregated, broadcast, and flushed, so those steps never run concurrently.
//
// stop():  status -> Stopped, signal the pipeline, pipeline closes the feed
//          and flushes every open candle, stop() returns once that is done.
// feed loss: the pipeline flips status to Stopped on its own, records the
//          reason, tells live subscribers, flushes, and exits. Nothing
//          restarts it; the next start() opens a fresh connection.
// store failure: a closed candle that cannot be persisted ends the session
//          the same way. The triggering trade is neither aggregated nor
//          broadcast, so no later bucket opens on a partial minute.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcaster::Broadcaster;
use crate::market_data::{CandleAggregator, FeedEvent, FeedHandle, TradeFeed};
use crate::storage::{CandleStore, StoreError};
use crate::types::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("streaming already started")]
    AlreadyRunning,

    #[error("streaming not started")]
    NotRunning,

    #[error("failed to open trade feed: {0:#}")]
    Feed(anyhow::Error),

    #[error("failed to flush open candles: {0}")]
    Flush(#[source] StoreError),

    #[error("session pipeline aborted: {0}")]
    Pipeline(String),
}

struct ActiveSession {
    stop_tx: oneshot::Sender<()>,
    pipeline: JoinHandle<Result<usize, StoreError>>,
}

pub struct StreamController {
    feed: Arc<dyn TradeFeed>,
    store: Arc<dyn CandleStore>,
    broadcaster: Arc<Broadcaster>,
    status: Arc<RwLock<SessionStatus>>,
    last_error: Arc<RwLock<Option<String>>>,
    session: Mutex<Option<ActiveSession>>,
}

impl StreamController {
    pub fn new(
        feed: Arc<dyn TradeFeed>,
        store: Arc<dyn CandleStore>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            feed,
            store,
            broadcaster,
            status: Arc::new(RwLock::new(SessionStatus::Stopped)),
            last_error: Arc::new(RwLock::new(None)),
            session: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    /// Why the last session ended on its own, if it did.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Open the feed and begin routing trades.
    pub async fn start(&self) -> Result<(), SessionError> {
        let mut session = self.session.lock().await;
        if self.status() == SessionStatus::Running {
            return Err(SessionError::AlreadyRunning);
        }

        // A session that ended on feed loss is still parked here.
        if let Some(stale) = session.take() {
            reap(stale).await;
        }

        let feed = self.feed.open().await.map_err(SessionError::Feed)?;
        let (stop_tx, stop_rx) = oneshot::channel();

        *self.status.write() = SessionStatus::Running;
        *self.last_error.write() = None;

        let pipeline = Pipeline {
            feed,
            aggregator: CandleAggregator::new(self.store.clone()),
            broadcaster: self.broadcaster.clone(),
            status: self.status.clone(),
            last_error: self.last_error.clone(),
        };
        let handle = tokio::spawn(pipeline.run(stop_rx));

        *session = Some(ActiveSession {
            stop_tx,
            pipeline: handle,
        });
        info!("streaming session started");
        Ok(())
    }

    /// Halt routing, close the feed, and flush every open candle. Returns the
    /// number of candles flushed.
    pub async fn stop(&self) -> Result<usize, SessionError> {
        let mut session = self.session.lock().await;
        {
            let mut status = self.status.write();
            if *status != SessionStatus::Running {
                return Err(SessionError::NotRunning);
            }
            *status = SessionStatus::Stopped;
        }

        let Some(active) = session.take() else {
            return Err(SessionError::NotRunning);
        };

        let _ = active.stop_tx.send(());
        match active.pipeline.await {
            Ok(Ok(flushed)) => {
                info!(flushed, "streaming session stopped");
                Ok(flushed)
            }
            Ok(Err(e)) => {
                error!(error = %e, "streaming stopped but open candles were not flushed");
                Err(SessionError::Flush(e))
            }
            Err(e) => {
                error!(error = %e, "session pipeline panicked");
                Err(SessionError::Pipeline(e.to_string()))
            }
        }
    }
}

async fn reap(stale: ActiveSession) {
    drop(stale.stop_tx);
    match stale.pipeline.await {
        Ok(Ok(flushed)) => debug!(flushed, "previous session reaped"),
        Ok(Err(e)) => warn!(error = %e, "previous session failed to flush"),
        Err(e) => warn!(error = %e, "previous session pipeline panicked"),
    }
}

// ---------------------------------------------------------------------------
// Pipeline task
// ---------------------------------------------------------------------------

struct Pipeline {
    feed: FeedHandle,
    aggregator: CandleAggregator,
    broadcaster: Arc<Broadcaster>,
    status: Arc<RwLock<SessionStatus>>,
    last_error: Arc<RwLock<Option<String>>>,
}

enum Step {
    Stop,
    Feed(Option<FeedEvent>),
}

impl Pipeline {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> Result<usize, StoreError> {
        loop {
            let step = tokio::select! {
                biased;
                _ = &mut stop_rx => Step::Stop,
                event = self.feed.recv() => Step::Feed(event),
            };

            match step {
                Step::Stop => {
                    debug!("stop requested");
                    break;
                }
                Step::Feed(Some(FeedEvent::Trade(trade))) => {
                    if *self.status.read() != SessionStatus::Running {
                        continue;
                    }
                    if let Err(e) = self.aggregator.on_trade(&trade).await {
                        error!(symbol = %trade.symbol, error = %e, "failed to persist closed candle; session stopped");
                        let reason = format!("failed to persist candle for {}: {e}", trade.symbol);
                        self.halt(&reason);
                        self.broadcaster.notify_store_down(&reason);
                        break;
                    }
                    self.broadcaster.on_trade(&trade);
                }
                Step::Feed(Some(FeedEvent::Disconnected { reason })) => {
                    self.feed_lost(reason);
                    break;
                }
                Step::Feed(None) => {
                    self.feed_lost("feed channel closed".to_string());
                    break;
                }
            }
        }

        self.feed.close().await;
        debug!(open = self.aggregator.open_count(), "flushing open candles");
        self.aggregator.flush_all().await
    }

    fn feed_lost(&self, reason: String) {
        error!(reason = %reason, "trade feed lost; session stopped");
        self.halt(&reason);
        self.broadcaster.notify_feed_down(&reason);
    }

    /// Stop routing on the pipeline's own initiative.
    fn halt(&self, reason: &str) {
        *self.status.write() = SessionStatus::Stopped;
        *self.last_error.write() = Some(reason.to_string());
    }
}
