//! Observability counters for the pipeline
//!
//! Tracks trade application, candle broadcast, slow-client drops,
//! checkpoint health and change feed restarts. `export()` returns a
//! `BTreeMap` for Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::warn;

/// Core metrics for the market data pipeline.
pub struct ServiceMetrics {
    // Aggregation
    pub trades_applied: AtomicU64,
    pub trades_duplicate: AtomicU64,
    pub trades_rejected: AtomicU64,
    pub trades_stale: AtomicU64,
    pub candles_truncated: AtomicU64,
    pub trade_apply_ns: Mutex<LatencyTracker>,

    // Broadcasting
    pub messages_broadcast: AtomicU64,
    pub messages_dropped_backpressure: AtomicU64,
    pub connected_clients: AtomicU64,

    // Dispatcher
    pub trades_fetched: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub feed_restarts: AtomicU64,
    pub checkpoints_written: AtomicU64,
    pub checkpoint_failures: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            trades_applied: AtomicU64::new(0),
            trades_duplicate: AtomicU64::new(0),
            trades_rejected: AtomicU64::new(0),
            trades_stale: AtomicU64::new(0),
            candles_truncated: AtomicU64::new(0),
            trade_apply_ns: Mutex::new(LatencyTracker::new(1000)),
            messages_broadcast: AtomicU64::new(0),
            messages_dropped_backpressure: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            trades_fetched: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            feed_restarts: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            checkpoint_failures: AtomicU64::new(0),
        }
    }

    /// Record a trade folded into the cache.
    pub fn record_trade_applied(&self, latency_ns: u64) {
        self.trades_applied.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tracker) = self.trade_apply_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_trade_duplicate(&self) {
        self.trades_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade_rejected(&self) {
        self.trades_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade_stale(&self) {
        self.trades_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_truncated(&self, candles: u64) {
        self.candles_truncated.fetch_add(candles, Ordering::Relaxed);
    }

    /// Record messages enqueued by one broadcast.
    pub fn record_broadcast(&self, recipients: u64) {
        self.messages_broadcast.fetch_add(recipients, Ordering::Relaxed);
    }

    /// Record a message dropped due to a full client queue.
    pub fn record_backpressure_drop(&self) {
        self.messages_dropped_backpressure.fetch_add(1, Ordering::Relaxed);
    }

    /// Update connected client count.
    pub fn set_connected_clients(&self, count: u64) {
        self.connected_clients.store(count, Ordering::Relaxed);
    }

    pub fn record_trades_fetched(&self, count: u64) {
        self.trades_fetched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_feed_restart(&self) {
        self.feed_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self, ok: bool) {
        if ok {
            self.checkpoints_written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Check alert thresholds, logging and returning any breaches.
    pub fn check_thresholds(&self, thresholds: &AlertThresholds) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let failures = self.checkpoint_failures.load(Ordering::Relaxed);
        if failures > thresholds.max_checkpoint_failures {
            alerts.push(Alert {
                level: AlertLevel::Critical,
                metric: "checkpoint_failures".to_string(),
                message: format!(
                    "Checkpoint failures: {} > threshold {}",
                    failures, thresholds.max_checkpoint_failures
                ),
            });
        }

        let bp_drops = self.messages_dropped_backpressure.load(Ordering::Relaxed);
        if bp_drops > thresholds.max_backpressure_drops {
            alerts.push(Alert {
                level: AlertLevel::Warning,
                metric: "backpressure_drops".to_string(),
                message: format!(
                    "Backpressure drops: {} > threshold {}",
                    bp_drops, thresholds.max_backpressure_drops
                ),
            });
        }

        if let Ok(tracker) = self.trade_apply_ns.lock() {
            if let Some(p99) = tracker.percentile(99) {
                if p99 > thresholds.max_trade_apply_p99_ns {
                    alerts.push(Alert {
                        level: AlertLevel::Warning,
                        metric: "trade_apply_p99".to_string(),
                        message: format!(
                            "Trade apply p99: {}ns > threshold {}ns",
                            p99, thresholds.max_trade_apply_p99_ns
                        ),
                    });
                }
            }
        }

        for alert in &alerts {
            warn!(level = ?alert.level, metric = %alert.metric, "{}", alert.message);
        }

        alerts
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("trades_applied", &self.trades_applied),
            ("trades_duplicate", &self.trades_duplicate),
            ("trades_rejected", &self.trades_rejected),
            ("trades_stale", &self.trades_stale),
            ("candles_truncated", &self.candles_truncated),
            ("messages_broadcast", &self.messages_broadcast),
            ("messages_dropped_backpressure", &self.messages_dropped_backpressure),
            ("connected_clients", &self.connected_clients),
            ("trades_fetched", &self.trades_fetched),
            ("fetch_failures", &self.fetch_failures),
            ("feed_restarts", &self.feed_restarts),
            ("checkpoints_written", &self.checkpoints_written),
            ("checkpoint_failures", &self.checkpoint_failures),
        ];
        counters
            .iter()
            .map(|(name, value)| (name.to_string(), value.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: std::collections::VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: std::collections::VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Number of samples recorded.
    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Alert severity level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// An alert triggered by threshold breach.
#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub metric: String,
    pub message: String,
}

/// Configurable alert thresholds.
#[derive(Debug, Clone)]
pub struct AlertThresholds {
    /// Checkpoint failures before a critical alert.
    pub max_checkpoint_failures: u64,
    pub max_backpressure_drops: u64,
    pub max_trade_apply_p99_ns: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_checkpoint_failures: 5,
            max_backpressure_drops: 1_000,
            max_trade_apply_p99_ns: 1_000_000, // 1ms
        }
    }
}
