//! Recent trade history for the trades channel
//!
//! Keeps a bounded ring of the latest trades per instrument. Subscribers to
//! the trades channel receive it (newest first) as their INIT payload.
//! Trades are kept in creation-time order even when catch-up pages arrive
//! behind live inserts.

use std::collections::{BTreeMap, VecDeque};

use types::ids::MarketId;
use types::trade::Trade;

/// Default number of trades kept per instrument.
pub const DEFAULT_HISTORY: usize = 100;

/// Bounded, time-ordered trade history of one instrument.
#[derive(Debug)]
pub struct TradeBuffer {
    /// Oldest first.
    history: VecDeque<Trade>,
    max_history: usize,
    symbol: MarketId,
}

impl TradeBuffer {
    pub fn new(symbol: MarketId, max_history: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_history),
            max_history,
            symbol,
        }
    }

    /// Insert a trade at its creation-time position, evicting the oldest
    /// trade when over capacity.
    ///
    /// Returns false if the trade was older than everything retained and
    /// got evicted straight away.
    pub fn record_trade(&mut self, trade: Trade) -> bool {
        let id = trade.id;
        let at = self
            .history
            .partition_point(|t| t.created_at <= trade.created_at);
        self.history.insert(at, trade);

        if self.history.len() > self.max_history {
            if let Some(evicted) = self.history.pop_front() {
                return evicted.id != id;
            }
        }
        true
    }

    /// Up to `limit` trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Vec<Trade> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn symbol(&self) -> &MarketId {
        &self.symbol
    }
}

/// Trade buffers for every instrument seen so far.
#[derive(Debug)]
pub struct TradeHistory {
    buffers: BTreeMap<MarketId, TradeBuffer>,
    max_history: usize,
}

impl TradeHistory {
    pub fn new(max_history: usize) -> Self {
        Self {
            buffers: BTreeMap::new(),
            max_history,
        }
    }

    pub fn record(&mut self, trade: &Trade) -> bool {
        let max_history = self.max_history;
        self.buffers
            .entry(trade.instrument_key.clone())
            .or_insert_with(|| TradeBuffer::new(trade.instrument_key.clone(), max_history))
            .record_trade(trade.clone())
    }

    /// Retained trades of one instrument, newest first. Empty if none.
    pub fn recent(&self, instrument: &MarketId) -> Vec<Trade> {
        self.buffers
            .get(instrument)
            .map(|buf| buf.recent_trades(self.max_history))
            .unwrap_or_default()
    }
}

impl Default for TradeHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn trade(at: i64) -> Trade {
        Trade::new(MarketId::new("BTC/USDT"), Decimal::from(50000), Decimal::ONE, at)
    }

    #[test]
    fn test_history_cache_eviction() {
        let mut buf = TradeBuffer::new(MarketId::new("BTC/USDT"), 3);
        for i in 0..5 {
            buf.record_trade(trade(1_000 + i));
        }

        assert_eq!(buf.history_len(), 3);
        let recent = buf.recent_trades(10);
        assert_eq!(recent[0].created_at, 1_004);
        assert_eq!(recent[2].created_at, 1_002);
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut buf = TradeBuffer::new(MarketId::new("BTC/USDT"), 10);
        buf.record_trade(trade(3_000));
        buf.record_trade(trade(1_000));
        buf.record_trade(trade(2_000));

        let times: Vec<i64> = buf.recent_trades(10).iter().map(|t| t.created_at).collect();
        assert_eq!(times, vec![3_000, 2_000, 1_000]);
    }

    #[test]
    fn test_too_old_when_full() {
        let mut buf = TradeBuffer::new(MarketId::new("BTC/USDT"), 2);
        assert!(buf.record_trade(trade(2_000)));
        assert!(buf.record_trade(trade(3_000)));
        assert!(!buf.record_trade(trade(1_000)));

        let times: Vec<i64> = buf.recent_trades(10).iter().map(|t| t.created_at).collect();
        assert_eq!(times, vec![3_000, 2_000]);
    }

    #[test]
    fn test_history_per_instrument() {
        let mut history = TradeHistory::new(10);
        history.record(&trade(1_000));
        history.record(&Trade::new(
            MarketId::new("ETH/USDT"),
            Decimal::from(3000),
            Decimal::ONE,
            1_500,
        ));

        assert_eq!(history.recent(&MarketId::new("BTC/USDT")).len(), 1);
        assert_eq!(history.recent(&MarketId::new("ETH/USDT")).len(), 1);
        assert!(history.recent(&MarketId::new("SOL/USDT")).is_empty());
    }
}
