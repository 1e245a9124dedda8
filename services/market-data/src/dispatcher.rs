//! Trade dispatcher
//!
//! Delivers every trade in the trade log to the registered subscribers in
//! creation-time order, including trades written before the process started
//! or while it was down.
//!
//! Startup sequence (`start_at`):
//! 1. Restore the persisted frame list (and the cache behind it).
//! 2. With no frames, add a synthetic frame at `now - max_catch_up`.
//! 3. Append the current frame `{now, now}`.
//! 4. Catch-up fetch `[from, now)`, where `from` is the previous frame's
//!    `last_time` if it is recent enough, otherwise `now - initial_fetch_window`.
//! 5. Commit a checkpoint.
//! 6. Spawn the live feed loop, the periodic checkpoint, and gap reconciliation.
//!
//! One mutex guards the frame list and is held while subscribers run, so
//! catch-up pages, live events and checkpoint captures never interleave.
//! Checkpoints are serialized by a second, async lock taken before it, so
//! snapshots reach storage in capture order.
//! Lock order is checkpoint, frames, then cache.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::trade::Trade;

use crate::clock::Clock;
use crate::metrics::{AlertThresholds, ServiceMetrics};
use crate::resolution::{Resolution, DAY_MS};
use crate::snapshot::{Snapshot, SnapshotError};
use crate::timeframe::{TimeFrame, TimeFrames};
use crate::trade_log::{ChangeStream, TradeChangeEvent, TradeLog};

/// Receives trades from the dispatcher.
///
/// Called synchronously while the dispatcher's delivery lock is held.
pub trait TradeSubscriber: Send + Sync {
    /// A trade read by a catch-up fetch.
    fn on_trade(&self, trade: &Trade);

    /// A live change feed event. Inserts are forwarded to `on_trade` by default.
    fn on_change(&self, event: &TradeChangeEvent) {
        if event.is_insert() {
            self.on_trade(&event.full_document);
        }
    }
}

/// Durable state saved alongside the frame list.
pub trait FrameCheckpoint: Send + Sync {
    /// Load persisted state, returning the saved frames. `None` means cold start.
    fn restore(&self) -> Option<TimeFrames>;

    /// Capture an in-memory snapshot consistent with `frames`.
    fn capture(&self, frames: &TimeFrames) -> Snapshot;

    /// Write a captured snapshot to durable storage.
    fn persist(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;
}

/// Configuration for the trade dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Trades per `get_trades` page.
    pub page_size: usize,
    pub checkpoint_interval: Duration,
    /// Startup fetch window when the last frame is too old to resume from (millis).
    pub initial_fetch_window_ms: i64,
    /// Oldest history the dispatcher will ever fetch (millis).
    pub max_catch_up_ms: i64,
    /// Delay before reopening a failed or closed change feed.
    pub watch_retry_delay: Duration,
    pub alerts: AlertThresholds,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            checkpoint_interval: Duration::from_secs(60),
            initial_fetch_window_ms: DAY_MS,
            max_catch_up_ms: Resolution::max_retention_ms(),
            watch_retry_delay: Duration::from_secs(1),
            alerts: AlertThresholds::default(),
        }
    }
}

pub struct TradeDispatcher {
    log: Arc<dyn TradeLog>,
    checkpoint: Arc<dyn FrameCheckpoint>,
    subscribers: Vec<Arc<dyn TradeSubscriber>>,
    frames: Mutex<TimeFrames>,
    commit_lock: tokio::sync::Mutex<()>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TradeDispatcher {
    pub fn new(
        config: DispatcherConfig,
        log: Arc<dyn TradeLog>,
        checkpoint: Arc<dyn FrameCheckpoint>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            log,
            checkpoint,
            subscribers: Vec::new(),
            frames: Mutex::new(TimeFrames::new()),
            commit_lock: tokio::sync::Mutex::new(()),
            config,
            clock,
            metrics,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a subscriber. Subscribers are invoked in registration order.
    pub fn with_subscriber(mut self, subscriber: Arc<dyn TradeSubscriber>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    fn lock_frames(&self) -> MutexGuard<'_, TimeFrames> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current frame list.
    pub fn frames(&self) -> TimeFrames {
        self.lock_frames().clone()
    }

    pub async fn start(self: &Arc<Self>) {
        let now = self.clock.now_ms();
        self.start_at(now).await;
    }

    /// Run the startup sequence with `now_ms` as the current time.
    pub async fn start_at(self: &Arc<Self>, now_ms: i64) {
        let restored = self.checkpoint.restore();

        let (from, current) = {
            let mut frames = self.lock_frames();
            *frames = restored.unwrap_or_default();

            let mut from = now_ms - self.config.initial_fetch_window_ms;
            match frames.last() {
                Some(last) => {
                    info!(first_time = last.first_time, last_time = last.last_time, "Resuming from last frame");
                    if now_ms - last.last_time < self.config.initial_fetch_window_ms {
                        from = last.last_time;
                    }
                }
                None => frames.push(TimeFrame::at(now_ms - self.config.max_catch_up_ms)),
            }
            frames.push(TimeFrame::at(now_ms));
            (from, frames.len() - 1)
        };

        // Open the feed before fetching so nothing written during the fetch is lost.
        let feed = match self.log.watch().await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!(error = %e, "Failed to open change feed before catch-up");
                None
            }
        };

        info!(from, to = now_ms, "Initial catch-up fetch");
        if self.fetch(from, now_ms, current).await {
            let mut frames = self.lock_frames();
            frames.extend_back(current, from);
            frames.coalesce();
        }

        if let Err(e) = self.commit().await {
            error!(error = %e, "Initial checkpoint failed");
        }

        let handles = vec![
            tokio::spawn(Arc::clone(self).run_live(feed)),
            tokio::spawn(Arc::clone(self).run_checkpoints()),
            tokio::spawn(Arc::clone(self).reconcile()),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!(subscribers = self.subscribers.len(), "TradeDispatcher started");
    }

    /// Stop background tasks and write a final checkpoint.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
        }
        if let Err(e) = self.commit().await {
            error!(error = %e, "Final checkpoint failed");
        }
        info!("TradeDispatcher stopped");
    }

    /// Page through `[from, to)` and deliver every trade.
    ///
    /// Returns true when the range was read to the end, false when the
    /// store failed part way.
    async fn fetch(&self, from: i64, to: i64, frame_index: usize) -> bool {
        let page_size = self.config.page_size.max(1);
        let mut offset = 0;
        loop {
            let mut page = match self.log.get_trades(from, to, offset, page_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, from, to, offset, "Catch-up fetch aborted");
                    self.metrics.record_fetch_failure();
                    return false;
                }
            };
            debug!(from, to, offset, trades = page.len(), "Fetched page");
            if page.is_empty() {
                return true;
            }
            page.sort_by_key(|t| t.created_at);

            {
                let mut frames = self.lock_frames();
                if offset == 0 {
                    frames.extend_back(frame_index, page[0].created_at);
                }
                for trade in &page {
                    for subscriber in &self.subscribers {
                        subscriber.on_trade(trade);
                    }
                }
            }
            self.metrics.record_trades_fetched(page.len() as u64);
            offset += page.len();
        }
    }

    /// Fill gaps between frames, newest first.
    async fn reconcile(self: Arc<Self>) {
        let gaps = self.lock_frames().gaps();
        for gap in gaps {
            debug!(from = gap.from, to = gap.to, "Filling gap");
            if self.fetch(gap.from, gap.to, gap.index).await {
                self.lock_frames().extend_back(gap.index, gap.from);
            }
        }
        let remaining = {
            let mut frames = self.lock_frames();
            frames.coalesce();
            frames.len()
        };
        info!(frames = remaining, "Gap reconciliation finished");
    }

    /// Consume the change feed until the process stops, reopening on failure.
    async fn run_live(self: Arc<Self>, mut pending: Option<ChangeStream>) {
        loop {
            let mut feed = match pending.take() {
                Some(feed) => feed,
                None => match self.log.watch().await {
                    Ok(feed) => feed,
                    Err(e) => {
                        error!(error = %e, "Failed to open change feed");
                        self.metrics.record_feed_restart();
                        tokio::time::sleep(self.config.watch_retry_delay).await;
                        continue;
                    }
                },
            };

            while let Some(item) = feed.next().await {
                match item {
                    Ok(event) => self.deliver(&event),
                    Err(e) => {
                        error!(error = %e, "Change feed read failed, restarting watch");
                        break;
                    }
                }
            }

            self.metrics.record_feed_restart();
            tokio::time::sleep(self.config.watch_retry_delay).await;
        }
    }

    fn deliver(&self, event: &TradeChangeEvent) {
        debug!(operation = ?event.operation_type, trade_id = %event.full_document.id, "Change event");
        let mut frames = self.lock_frames();
        if event.is_insert() {
            frames.advance_last(event.full_document.created_at);
        }
        for subscriber in &self.subscribers {
            subscriber.on_change(event);
        }
    }

    async fn run_checkpoints(self: Arc<Self>) {
        let period = self.config.checkpoint_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(e) = self.commit().await {
                error!(error = %e, "Checkpoint failed, retrying next tick");
            }
            self.metrics.check_thresholds(&self.config.alerts);
        }
    }

    /// Capture frames and cache under the delivery lock, then write outside it.
    ///
    /// Concurrent commits run one at a time, so an older capture never
    /// overwrites a newer one.
    pub async fn commit(&self) -> Result<(), SnapshotError> {
        let _commit = self.commit_lock.lock().await;
        let snapshot = {
            let frames = self.lock_frames();
            self.checkpoint.capture(&frames)
        };
        let checkpoint = Arc::clone(&self.checkpoint);
        tokio::task::spawn_blocking(move || checkpoint.persist(&snapshot))
            .await
            .map_err(|e| SnapshotError::Task(e.to_string()))?
    }
}
