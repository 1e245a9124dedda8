//! Multi-resolution aggregation cache
//!
//! Maps `(instrument, resolution)` to an ordered series of candles keyed by
//! bucket start. Every admitted trade updates one candle per resolution in
//! the table, except resolutions whose retention window the trade already
//! falls outside of.
//!
//! One `RwLock` guards every series and the dedup window:
//! - `apply_trade` and `truncate` take the write lock
//! - queries take the read lock through [`CacheView`]
//! - the lock is never held across file I/O
//!
//! The `on_update` callback of [`AggregationCache::apply_trade`] runs while
//! the write lock is held, so a subscriber that reads a snapshot through a
//! [`CacheView`] and then registers cannot miss an update.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::MarketId;
use types::trade::Trade;

use crate::candles::{self, Candle};
use crate::clock::Clock;
use crate::dispatcher::FrameCheckpoint;
use crate::ingestion::{IngesterConfig, IngestionError, TradeIngester};
use crate::metrics::ServiceMetrics;
use crate::resolution::{Resolution, TimeUnit, DAY_MS};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotStore};
use crate::timeframe::TimeFrames;

/// Identifies one candle series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub instrument: MarketId,
    pub duration: u32,
    pub unit: TimeUnit,
}

impl SeriesKey {
    pub fn new(instrument: MarketId, resolution: &Resolution) -> Self {
        Self {
            instrument,
            duration: resolution.duration,
            unit: resolution.unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("unknown resolution: {duration} {unit}")]
    UnknownResolution { duration: u32, unit: String },

    #[error("invalid range: from {from} is after to {to}")]
    InvalidRange { from: i64, to: i64 },
}

/// Configuration for the aggregation cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often buckets outside their retention window are dropped.
    pub truncate_interval: Duration,
    pub ingester: IngesterConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            truncate_interval: Duration::from_secs(60),
            ingester: IngesterConfig::default(),
        }
    }
}

/// What happened to a trade handed to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Number of candles updated.
    Applied(usize),
    Duplicate,
    Rejected,
    /// Older than every resolution's retention window.
    Stale,
}

struct CacheState {
    series: BTreeMap<SeriesKey, BTreeMap<i64, Candle>>,
    ingester: TradeIngester,
}

pub struct AggregationCache {
    state: RwLock<CacheState>,
    store: SnapshotStore,
    config: CacheConfig,
    metrics: Arc<ServiceMetrics>,
}

impl AggregationCache {
    pub fn new(config: CacheConfig, store: SnapshotStore, metrics: Arc<ServiceMetrics>) -> Self {
        info!(
            resolutions = Resolution::all().len(),
            snapshot = %store.path().display(),
            truncate_interval_secs = config.truncate_interval.as_secs(),
            "AggregationCache initialized"
        );
        Self {
            state: RwLock::new(CacheState {
                series: BTreeMap::new(),
                ingester: TradeIngester::new(config.ingester.clone()),
            }),
            store,
            config,
            metrics,
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the read lock for a consistent view across several queries.
    pub fn read(&self) -> CacheView<'_> {
        CacheView {
            state: self.state.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Fold a trade into every resolution.
    ///
    /// `on_update` receives the updated candles and runs under the write
    /// lock; it is not called for duplicates, rejected or stale trades.
    pub fn apply_trade<F>(&self, trade: &Trade, now_ms: i64, on_update: F) -> ApplyOutcome
    where
        F: FnOnce(&[Candle]),
    {
        let started = Instant::now();
        let mut state = self.write();

        match state.ingester.admit(trade) {
            Ok(()) => {}
            Err(IngestionError::DuplicateTrade(_)) => {
                self.metrics.record_trade_duplicate();
                return ApplyOutcome::Duplicate;
            }
            Err(err @ IngestionError::InvalidTrade { .. }) => {
                warn!(error = %err, instrument = %trade.instrument_key, "Skipping invalid trade");
                self.metrics.record_trade_rejected();
                return ApplyOutcome::Rejected;
            }
        }

        let mut updated = Vec::with_capacity(Resolution::all().len());
        for resolution in Resolution::all() {
            if trade.created_at < resolution.retention_cutoff(now_ms) {
                continue;
            }
            let bucket = resolution.bucket_start(trade.created_at);
            let series = state
                .series
                .entry(SeriesKey::new(trade.instrument_key.clone(), resolution))
                .or_default();
            let candle = series
                .entry(bucket)
                .and_modify(|c| c.apply(trade.price, trade.amount, trade.created_at))
                .or_insert_with(|| {
                    Candle::open_with(
                        trade.instrument_key.clone(),
                        resolution,
                        bucket,
                        trade.price,
                        trade.amount,
                        trade.created_at,
                    )
                });
            updated.push(candle.clone());
        }

        if updated.is_empty() {
            debug!(trade_id = %trade.id, created_at = trade.created_at, "Trade outside every retention window");
            self.metrics.record_trade_stale();
            return ApplyOutcome::Stale;
        }

        on_update(&updated);
        drop(state);

        self.metrics
            .record_trade_applied(started.elapsed().as_nanos() as u64);
        ApplyOutcome::Applied(updated.len())
    }

    /// Drop buckets older than each resolution's retention window.
    ///
    /// Returns the number of candles removed.
    pub fn truncate(&self, now_ms: i64) -> usize {
        let mut state = self.write();
        let mut removed = 0;

        state.series.retain(|key, buckets| {
            let Some(resolution) = Resolution::lookup(key.duration, key.unit) else {
                removed += buckets.len();
                return false;
            };
            let keep = buckets.split_off(&resolution.retention_cutoff(now_ms));
            removed += buckets.len();
            *buckets = keep;
            !buckets.is_empty()
        });
        drop(state);

        if removed > 0 {
            debug!(removed, "Truncated expired candles");
            self.metrics.record_truncated(removed as u64);
        }
        removed
    }

    /// Buckets of one resolution inside `[from, to]`, ascending.
    pub fn ohlcv(
        &self,
        instrument: &MarketId,
        duration: u32,
        unit: TimeUnit,
        from: Option<i64>,
        to: Option<i64>,
        now_ms: i64,
    ) -> Result<Vec<Candle>, QueryError> {
        self.read().ohlcv(instrument, duration, unit, from, to, now_ms)
    }

    /// Summary of the trailing 24 hours.
    pub fn trailing_24h(&self, instrument: &MarketId, now_ms: i64) -> Candle {
        self.read().trailing_24h(instrument, now_ms)
    }

    /// Replace the cache contents with a snapshot's candles.
    ///
    /// Candles of resolutions not in the table are dropped.
    pub fn restore_candles(&self, candles: Vec<Candle>) -> usize {
        let mut series: BTreeMap<SeriesKey, BTreeMap<i64, Candle>> = BTreeMap::new();
        let mut restored = 0;
        for candle in candles {
            let Some(resolution) = Resolution::lookup(candle.duration, candle.unit) else {
                warn!(
                    duration = candle.duration,
                    unit = %candle.unit,
                    "Dropping snapshot candle with unknown resolution"
                );
                continue;
            };
            series
                .entry(SeriesKey::new(candle.instrument_key.clone(), resolution))
                .or_default()
                .insert(candle.timestamp_ms, candle);
            restored += 1;
        }
        self.write().series = series;
        restored
    }

    /// All candles, flattened in series order.
    pub fn flatten(&self) -> Vec<Candle> {
        self.read()
            .state
            .series
            .values()
            .flat_map(|buckets| buckets.values().cloned())
            .collect()
    }

    /// Periodically truncate on `truncate_interval`.
    pub fn spawn_truncation(self: &Arc<Self>, clock: Arc<dyn Clock>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.truncate_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                cache.truncate(clock.now_ms());
            }
        })
    }
}

impl FrameCheckpoint for AggregationCache {
    fn restore(&self) -> Option<TimeFrames> {
        match self.store.load() {
            Ok(Some(snapshot)) => {
                let restored = self.restore_candles(snapshot.candles);
                let seen = snapshot.seen_trades.len();
                self.write().ingester.remember(snapshot.seen_trades);
                info!(
                    frames = snapshot.frames.len(),
                    candles = restored,
                    seen_trades = seen,
                    "Restored cache snapshot"
                );
                Some(snapshot.frames)
            }
            Ok(None) => {
                info!(path = %self.store.path().display(), "No cache snapshot, cold start");
                None
            }
            Err(e) => {
                warn!(error = %e, path = %self.store.path().display(), "Unreadable cache snapshot, cold start");
                None
            }
        }
    }

    /// Candles plus the applied ids that a later fetch can read again.
    fn capture(&self, frames: &TimeFrames) -> Snapshot {
        let view = self.read();
        let candles = view
            .state
            .series
            .values()
            .flat_map(|buckets| buckets.values().cloned())
            .collect();
        let seen = view
            .state
            .ingester
            .seen_trades()
            .filter(|seen| !frames.is_interior(seen.created_at))
            .copied()
            .collect();
        Snapshot::new(frames.clone(), candles).with_seen_trades(seen)
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        let result = self.store.save(snapshot);
        self.metrics.record_checkpoint(result.is_ok());
        if result.is_ok() {
            debug!(candles = snapshot.candles.len(), "Checkpoint written");
        }
        result
    }
}

/// Read-locked view of the cache.
pub struct CacheView<'a> {
    state: RwLockReadGuard<'a, CacheState>,
}

impl CacheView<'_> {
    /// Buckets of `(duration, unit)` with start in `[from, to]`, ascending.
    ///
    /// Missing bounds default to one retention window ending at `now_ms`.
    /// Unknown instruments yield an empty list.
    pub fn ohlcv(
        &self,
        instrument: &MarketId,
        duration: u32,
        unit: TimeUnit,
        from: Option<i64>,
        to: Option<i64>,
        now_ms: i64,
    ) -> Result<Vec<Candle>, QueryError> {
        let resolution =
            Resolution::lookup(duration, unit).ok_or_else(|| QueryError::UnknownResolution {
                duration,
                unit: unit.to_string(),
            })?;
        let from = from.unwrap_or_else(|| resolution.retention_cutoff(now_ms));
        let to = to.unwrap_or(now_ms);
        if from > to {
            return Err(QueryError::InvalidRange { from, to });
        }

        let key = SeriesKey::new(instrument.clone(), resolution);
        Ok(self
            .state
            .series
            .get(&key)
            .map(|buckets| buckets.range(from..=to).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    /// Fold the 1-minute buckets of the trailing 24 hours into one candle.
    ///
    /// No buckets yields a zero-volume placeholder.
    pub fn trailing_24h(&self, instrument: &MarketId, now_ms: i64) -> Candle {
        let key = SeriesKey::new(instrument.clone(), Resolution::minute());
        let begin = now_ms - DAY_MS;
        match self.state.series.get(&key) {
            Some(buckets) => candles::summarize(instrument, buckets.range(begin..).map(|(_, c)| c), now_ms),
            None => candles::summarize(instrument, std::iter::empty(), now_ms),
        }
    }

    /// Instruments with at least one candle.
    pub fn instruments(&self) -> Vec<MarketId> {
        let mut out: Vec<MarketId> = self
            .state
            .series
            .keys()
            .map(|k| k.instrument.clone())
            .collect();
        out.dedup();
        out
    }

    pub fn candle_count(&self) -> usize {
        self.state.series.values().map(BTreeMap::len).sum()
    }
}
