//! Trade execution types
//!
//! A trade is an immutable, already-settled execution read from the
//! trade log. Timestamps are Unix milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::TradeError;
use crate::ids::{MarketId, TradeId};

/// Settled trade as stored in the trade log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: TradeId,
    pub instrument_key: MarketId,
    pub price: Decimal,
    pub amount: Decimal,
    /// Creation time (Unix millis)
    pub created_at: i64,
}

impl Trade {
    /// Create a new trade with a fresh id
    pub fn new(instrument_key: MarketId, price: Decimal, amount: Decimal, created_at: i64) -> Self {
        Self {
            id: TradeId::new(),
            instrument_key,
            price,
            amount,
            created_at,
        }
    }

    /// Trade value (price × amount)
    pub fn value(&self) -> Decimal {
        self.price * self.amount
    }

    /// Creation time as a UTC datetime, if representable
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    /// Check that the trade can be aggregated.
    pub fn validate(&self) -> Result<(), TradeError> {
        if self.price <= Decimal::ZERO {
            return Err(TradeError::InvalidPrice(self.price.to_string()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(TradeError::InvalidAmount(self.amount.to_string()));
        }
        if self.created_at_utc().is_none() {
            return Err(TradeError::InvalidTimestamp(self.created_at));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(price: i64, amount: i64) -> Trade {
        Trade::new(
            MarketId::new("BTC/USDT"),
            Decimal::from(price),
            Decimal::from(amount),
            1_708_123_456_789,
        )
    }

    #[test]
    fn test_trade_creation() {
        let t = trade(50000, 2);
        assert_eq!(t.value(), Decimal::from(100000));
        assert!(t.validate().is_ok());
    }

    #[test]
    fn test_trade_rejects_non_positive_price() {
        let t = trade(0, 1);
        assert!(matches!(t.validate(), Err(TradeError::InvalidPrice(_))));
    }

    #[test]
    fn test_trade_rejects_non_positive_amount() {
        let t = trade(100, -1);
        assert!(matches!(t.validate(), Err(TradeError::InvalidAmount(_))));
    }

    #[test]
    fn test_created_at_utc() {
        let t = trade(100, 1);
        let dt = t.created_at_utc().unwrap();
        assert_eq!(dt.timestamp_millis(), 1_708_123_456_789);
    }

    #[test]
    fn test_trade_wire_format() {
        let t = trade(100, 1);
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["instrumentKey"], "BTC/USDT");
        assert_eq!(json["price"], "100");
        assert_eq!(json["createdAt"], 1_708_123_456_789_i64);

        let back: Trade = serde_json::from_value(json).unwrap();
        assert_eq!(back, t);
    }
}
