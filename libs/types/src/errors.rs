//! Error types shared across the pipeline
//!
//! Error taxonomy using thiserror

use thiserror::Error;

/// Trade-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradeError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid instrument key: {key}")]
    InvalidInstrument { key: String },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}
