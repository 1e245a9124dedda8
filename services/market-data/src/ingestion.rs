//! Trade admission for the candle cache
//!
//! Validates incoming trades and drops repeats. The catch-up fetch and the
//! live feed overlap at hand-off, so the same trade can arrive twice; the
//! ingester remembers a bounded window of applied trade ids and rejects
//! anything it has already seen.
//!
//! The window can be exported as [`SeenTrade`]s and seeded back after a
//! restart, for trades a resume fetch is going to read again.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use tracing::{debug, info};
use types::errors::TradeError;
use types::ids::TradeId;
use types::trade::Trade;

/// Errors that can occur during trade admission.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestionError {
    #[error("duplicate trade: {0} already applied")]
    DuplicateTrade(TradeId),

    #[error("rejected trade {id}: {source}")]
    InvalidTrade {
        id: TradeId,
        #[source]
        source: TradeError,
    },
}

/// An applied trade id with its creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeenTrade {
    pub id: TradeId,
    pub created_at: i64,
}

/// Configuration for the trade ingester.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Maximum number of recent trade ids to track for dedup.
    pub dedup_window: usize,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            dedup_window: 100_000,
        }
    }
}

/// Validates and deduplicates trades before aggregation.
#[derive(Debug)]
pub struct TradeIngester {
    seen: HashSet<TradeId>,
    /// Admission order, oldest first, for window eviction.
    order: VecDeque<SeenTrade>,
    config: IngesterConfig,
    trades_accepted: u64,
    trades_duplicate: u64,
    trades_rejected: u64,
}

impl TradeIngester {
    pub fn new(config: IngesterConfig) -> Self {
        info!(dedup_window = config.dedup_window, "TradeIngester initialized");

        Self {
            seen: HashSet::with_capacity(config.dedup_window.min(1 << 16)),
            order: VecDeque::with_capacity(config.dedup_window.min(1 << 16)),
            config,
            trades_accepted: 0,
            trades_duplicate: 0,
            trades_rejected: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(IngesterConfig::default())
    }

    /// Admit a trade for aggregation.
    ///
    /// On success the trade id is recorded, so a second call with the same
    /// trade returns [`IngestionError::DuplicateTrade`].
    pub fn admit(&mut self, trade: &Trade) -> Result<(), IngestionError> {
        if self.seen.contains(&trade.id) {
            self.trades_duplicate += 1;
            debug!(trade_id = %trade.id, "Dropping duplicate trade");
            return Err(IngestionError::DuplicateTrade(trade.id));
        }

        if let Err(source) = trade.validate() {
            self.trades_rejected += 1;
            return Err(IngestionError::InvalidTrade {
                id: trade.id,
                source,
            });
        }

        self.record(SeenTrade {
            id: trade.id,
            created_at: trade.created_at,
        });
        self.trades_accepted += 1;
        Ok(())
    }

    /// Whether a trade id is inside the dedup window.
    pub fn has_seen(&self, id: &TradeId) -> bool {
        self.seen.contains(id)
    }

    /// Ids in the window, oldest first.
    pub fn seen_trades(&self) -> impl Iterator<Item = &SeenTrade> {
        self.order.iter()
    }

    /// Seed the window with ids applied by an earlier run.
    pub fn remember(&mut self, trades: impl IntoIterator<Item = SeenTrade>) {
        for seen in trades {
            if !self.seen.contains(&seen.id) {
                self.record(seen);
            }
        }
    }

    pub fn trades_accepted(&self) -> u64 {
        self.trades_accepted
    }

    pub fn trades_duplicate(&self) -> u64 {
        self.trades_duplicate
    }

    pub fn trades_rejected(&self) -> u64 {
        self.trades_rejected
    }

    fn record(&mut self, entry: SeenTrade) {
        if self.config.dedup_window == 0 {
            return;
        }
        while self.order.len() >= self.config.dedup_window {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted.id);
            }
        }
        self.seen.insert(entry.id);
        self.order.push_back(entry);
    }
}
