//! Trade log source
//!
//! The dispatcher reads history through [`TradeLog::get_trades`] (pages
//! over `[from, to)` ordered by creation time) and follows new trades
//! through [`TradeLog::watch`], a change feed of insert/update/replace
//! events. [`MemoryTradeLog`] is an in-process implementation used by
//! tests and embedders.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::trade::Trade;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TradeLogError {
    #[error("trade store unavailable: {0}")]
    Unavailable(String),

    #[error("change feed failed: {0}")]
    Feed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
}

/// One change feed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeChangeEvent {
    pub operation_type: OperationType,
    pub full_document: Trade,
}

impl TradeChangeEvent {
    pub fn insert(trade: Trade) -> Self {
        Self {
            operation_type: OperationType::Insert,
            full_document: trade,
        }
    }

    pub fn is_insert(&self) -> bool {
        self.operation_type == OperationType::Insert
    }
}

pub type ChangeStream = BoxStream<'static, Result<TradeChangeEvent, TradeLogError>>;

#[async_trait]
pub trait TradeLog: Send + Sync {
    /// Trades with `from <= createdAt < to`, creation time ascending.
    async fn get_trades(
        &self,
        from: i64,
        to: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Trade>, TradeLogError>;

    /// Open the live change feed.
    async fn watch(&self) -> Result<ChangeStream, TradeLogError>;
}

/// A `get_trades` call as seen by [`MemoryTradeLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub from: i64,
    pub to: i64,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Default)]
struct MemoryState {
    trades: Vec<Trade>,
    watchers: Vec<mpsc::UnboundedSender<Result<TradeChangeEvent, TradeLogError>>>,
    requests: Vec<FetchRequest>,
    failing_fetches: usize,
    failing_watches: usize,
}

/// In-memory trade log with a broadcast change feed.
#[derive(Default)]
pub struct MemoryTradeLog {
    state: Mutex<MemoryState>,
}

impl MemoryTradeLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a trade without notifying watchers (history written while
    /// nobody was listening).
    pub fn seed(&self, trade: Trade) {
        self.state().trades.push(trade);
    }

    /// Store a trade and publish an insert event to every open feed.
    pub fn insert(&self, trade: Trade) {
        let mut state = self.state();
        state.trades.push(trade.clone());
        let event = TradeChangeEvent::insert(trade);
        state
            .watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// Publish an arbitrary change event without touching stored trades.
    pub fn publish(&self, event: TradeChangeEvent) {
        self.state()
            .watchers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// Push a read error into every open feed and close them.
    pub fn break_feeds(&self, reason: &str) {
        let mut state = self.state();
        for tx in state.watchers.drain(..) {
            let _ = tx.unbounded_send(Err(TradeLogError::Feed(reason.to_string())));
        }
    }

    /// Make the next `count` calls to `get_trades` fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state().failing_fetches = count;
    }

    /// Make the next `count` calls to `watch` fail.
    pub fn fail_next_watches(&self, count: usize) {
        self.state().failing_watches = count;
    }

    /// Every `get_trades` call received so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    pub fn open_feeds(&self) -> usize {
        self.state()
            .watchers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[async_trait]
impl TradeLog for MemoryTradeLog {
    async fn get_trades(
        &self,
        from: i64,
        to: i64,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Trade>, TradeLogError> {
        let mut state = self.state();
        state.requests.push(FetchRequest {
            from,
            to,
            offset,
            limit,
        });
        if state.failing_fetches > 0 {
            state.failing_fetches -= 1;
            return Err(TradeLogError::Unavailable("injected fetch failure".into()));
        }

        let mut matching: Vec<Trade> = state
            .trades
            .iter()
            .filter(|t| t.created_at >= from && t.created_at < to)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.created_at);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn watch(&self) -> Result<ChangeStream, TradeLogError> {
        let mut state = self.state();
        if state.failing_watches > 0 {
            state.failing_watches -= 1;
            return Err(TradeLogError::Feed("injected watch failure".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push(tx);
        Ok(rx.boxed())
    }
}
