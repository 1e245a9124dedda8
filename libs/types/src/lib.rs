//! Types library for the market data pipeline
//!
//! Core type definitions shared by the trade dispatcher, the candle cache
//! and the broadcast layer.
//!
//! # Modules
//! - `ids`: Unique identifiers (TradeId, MarketId)
//! - `trade`: Settled trade executions as read from the trade log
//! - `errors`: Error taxonomy

pub mod errors;
pub mod ids;
pub mod trade;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::*;
    pub use crate::ids::*;
    pub use crate::trade::*;
}
