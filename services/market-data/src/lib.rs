//! Market Data Service
//!
//! Turns the trade log into live market data:
//! - Catch-up and live delivery of every trade, resumable across restarts
//! - OHLCV candles at sixteen resolutions, 1 second to 1 year
//! - Trailing 24 hour summaries
//! - Channel subscriptions with INIT snapshots and UPDATE broadcasts
//! - Periodic checkpoints of candles and covered time ranges
//!
//! # Architecture
//!
//! ```text
//!      Trade log (pages + change feed)
//!                 │
//!         ┌───────▼────────┐
//!         │ TradeDispatcher│  ← frames, catch-up, gap fill, checkpoints
//!         └───────┬────────┘
//!                 │ on_trade / on_change
//!        ┌────────▼─────────┐
//!        │MarketDataService │
//!        └──┬───────────┬───┘
//!           │           │
//!   ┌───────▼──────┐ ┌──▼──────────┐
//!   │Aggregation   │ │TradeHistory │
//!   │Cache         │ └──┬──────────┘
//!   └───────┬──────┘    │
//!           │           │
//!   ┌───────▼───────────▼───┐
//!   │ SubscriptionRegistry  │  ← per-client bounded queues
//!   └───────────────────────┘
//! ```

pub mod cache;
pub mod candles;
pub mod channels;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod ingestion;
pub mod metrics;
pub mod outbound;
pub mod registry;
pub mod resolution;
pub mod service;
pub mod snapshot;
pub mod timeframe;
pub mod trade_log;
pub mod trades;

pub use cache::AggregationCache;
pub use config::MarketDataConfig;
pub use dispatcher::TradeDispatcher;
pub use service::{MarketDataRuntime, MarketDataService};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
