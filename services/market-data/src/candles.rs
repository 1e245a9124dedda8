//! OHLCV candles
//!
//! A candle is keyed by `(instrument, resolution, bucket start)` and is
//! created lazily by the first trade that lands in its bucket. Later
//! trades in the same bucket move close/high/low and accumulate volume
//! and count. Uses `Decimal` for all arithmetic.
//!
//! Wire shape (camelCase): `instrumentKey, open, high, low, close,
//! volume, volumeByQuote, count, openTime, closeTime, timestampMs,
//! duration, unit`. Volumes and count are decimal strings.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::MarketId;

use crate::resolution::{Resolution, TimeUnit};

/// Resolution tag carried by the trailing 24h summary candle.
pub const TRAILING_24H: (u32, TimeUnit) = (24, TimeUnit::Hour);

/// A single OHLCV candle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub instrument_key: MarketId,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Sum of `price * amount`.
    pub volume_by_quote: Decimal,
    #[serde(with = "count_string")]
    pub count: u64,
    /// Time of the first trade in the candle.
    pub open_time: i64,
    /// Time of the latest trade in the candle.
    pub close_time: i64,
    /// Bucket start (Unix millis).
    pub timestamp_ms: i64,
    pub duration: u32,
    pub unit: TimeUnit,
}

impl Candle {
    /// Create a candle from the first trade in its bucket.
    pub fn open_with(
        instrument_key: MarketId,
        resolution: &Resolution,
        bucket_start: i64,
        price: Decimal,
        amount: Decimal,
        traded_at: i64,
    ) -> Self {
        Self {
            instrument_key,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: amount,
            volume_by_quote: price * amount,
            count: 1,
            open_time: traded_at,
            close_time: traded_at,
            timestamp_ms: bucket_start,
            duration: resolution.duration,
            unit: resolution.unit,
        }
    }

    /// Zero-volume candle for a window with no trades.
    pub fn empty(instrument_key: MarketId, duration: u32, unit: TimeUnit, timestamp_ms: i64) -> Self {
        Self {
            instrument_key,
            open: Decimal::ZERO,
            high: Decimal::ZERO,
            low: Decimal::ZERO,
            close: Decimal::ZERO,
            volume: Decimal::ZERO,
            volume_by_quote: Decimal::ZERO,
            count: 0,
            open_time: timestamp_ms,
            close_time: timestamp_ms,
            timestamp_ms,
            duration,
            unit,
        }
    }

    /// Update the candle with a new trade.
    pub fn apply(&mut self, price: Decimal, amount: Decimal, traded_at: i64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += amount;
        self.volume_by_quote += price * amount;
        self.count += 1;
        self.close_time = traded_at;
    }

    /// Validate candle integrity (OHLCV invariants).
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.high >= self.low
            && self.low <= self.open
            && self.low <= self.close
            && self.volume >= Decimal::ZERO
    }

    /// Whether this candle belongs to `resolution`.
    pub fn has_resolution(&self, resolution: &Resolution) -> bool {
        self.duration == resolution.duration && self.unit == resolution.unit
    }
}

/// Fold ascending buckets into one summary candle.
///
/// Open comes from the earliest bucket and close from the latest; high and
/// low are the extrema; volumes and count are summed. The summary is stamped
/// with the latest bucket's start and closes at its close time. No buckets
/// yields a zero-volume candle stamped `now_ms`.
pub fn summarize<'a>(
    instrument_key: &MarketId,
    buckets: impl IntoIterator<Item = &'a Candle>,
    now_ms: i64,
) -> Candle {
    let (duration, unit) = TRAILING_24H;
    let mut summary: Option<Candle> = None;

    for bucket in buckets {
        match summary.as_mut() {
            None => {
                let mut first = bucket.clone();
                first.duration = duration;
                first.unit = unit;
                summary = Some(first);
            }
            Some(acc) => {
                if bucket.high > acc.high {
                    acc.high = bucket.high;
                }
                if bucket.low < acc.low {
                    acc.low = bucket.low;
                }
                acc.close = bucket.close;
                acc.volume += bucket.volume;
                acc.volume_by_quote += bucket.volume_by_quote;
                acc.count += bucket.count;
                acc.close_time = bucket.close_time;
                acc.timestamp_ms = bucket.timestamp_ms;
            }
        }
    }

    summary.unwrap_or_else(|| Candle::empty(instrument_key.clone(), duration, unit, now_ms))
}

/// Serializes a `u64` as a decimal string and accepts either form back.
mod count_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(D::Error::custom),
            Repr::Number(n) => Ok(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minute() -> &'static Resolution {
        Resolution::minute()
    }

    fn btc() -> MarketId {
        MarketId::new("BTC/USDT")
    }

    fn candle(ts: i64, open: i64, high: i64, low: i64, close: i64, volume: i64, count: u64) -> Candle {
        Candle {
            instrument_key: btc(),
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::from(volume),
            volume_by_quote: Decimal::from(volume * close),
            count,
            open_time: ts,
            close_time: ts + 59_000,
            timestamp_ms: ts,
            duration: 1,
            unit: TimeUnit::Min,
        }
    }

    #[test]
    fn test_single_trade_candle() {
        let c = Candle::open_with(btc(), minute(), 60_000, Decimal::from(100), Decimal::from(2), 61_500);
        assert_eq!(c.open, Decimal::from(100));
        assert_eq!(c.high, Decimal::from(100));
        assert_eq!(c.low, Decimal::from(100));
        assert_eq!(c.close, Decimal::from(100));
        assert_eq!(c.volume, Decimal::from(2));
        assert_eq!(c.count, 1);
        assert_eq!(c.volume_by_quote, Decimal::from(200));
        assert_eq!((c.open_time, c.close_time), (61_500, 61_500));
        assert!(c.is_valid());
    }

    #[test]
    fn test_candle_apply() {
        let mut c = Candle::open_with(btc(), minute(), 0, Decimal::from(100), Decimal::ONE, 1_000);
        c.apply(Decimal::from(105), Decimal::ONE, 2_000);
        c.apply(Decimal::from(95), Decimal::new(5, 1), 3_000);
        c.apply(Decimal::from(102), Decimal::ONE, 4_000);

        assert_eq!(c.open, Decimal::from(100));
        assert_eq!(c.high, Decimal::from(105));
        assert_eq!(c.low, Decimal::from(95));
        assert_eq!(c.close, Decimal::from(102));
        assert_eq!(c.volume, Decimal::new(35, 1));
        assert_eq!(c.volume_by_quote, Decimal::new(3545, 1));
        assert_eq!(c.count, 4);
        assert_eq!((c.open_time, c.close_time), (1_000, 4_000));
        assert!(c.is_valid());
    }

    #[test]
    fn test_invalid_candle_detected() {
        let bad = candle(0, 100, 90, 80, 85, 1, 1);
        assert!(!bad.is_valid());
    }

    #[test]
    fn test_summarize_folds_buckets() {
        let buckets = vec![
            candle(0, 100, 110, 99, 105, 2, 3),
            candle(60_000, 105, 120, 101, 118, 1, 1),
            candle(120_000, 118, 119, 90, 95, 4, 2),
        ];
        let s = summarize(&btc(), &buckets, 200_000);

        assert_eq!(s.open, Decimal::from(100));
        assert_eq!(s.close, Decimal::from(95));
        assert_eq!(s.high, Decimal::from(120));
        assert_eq!(s.low, Decimal::from(90));
        assert_eq!(s.volume, Decimal::from(7));
        assert_eq!(s.volume_by_quote, Decimal::from(210 + 118 + 380));
        assert_eq!(s.count, 6);
        assert_eq!((s.open_time, s.close_time), (0, 179_000));
        assert_eq!(s.timestamp_ms, 120_000);
        assert_eq!((s.duration, s.unit), TRAILING_24H);
    }

    #[test]
    fn test_summarize_empty_is_placeholder() {
        let s = summarize(&btc(), &[], 5_000);
        assert_eq!(s.volume, Decimal::ZERO);
        assert_eq!(s.volume_by_quote, Decimal::ZERO);
        assert_eq!(s.count, 0);
        assert_eq!(s.timestamp_ms, 5_000);
        assert_eq!(s.instrument_key, btc());
    }

    #[test]
    fn test_wire_format() {
        let c = candle(60_000, 100, 105, 95, 102, 4, 4);
        let json = serde_json::to_value(&c).unwrap();

        assert_eq!(json["instrumentKey"], "BTC/USDT");
        assert_eq!(json["volume"], "4");
        assert_eq!(json["volumeByQuote"], "408");
        assert_eq!(json["count"], "4");
        assert_eq!(json["openTime"], 60_000);
        assert_eq!(json["closeTime"], 119_000);
        assert_eq!(json["timestampMs"], 60_000);
        assert_eq!(json["duration"], 1);
        assert_eq!(json["unit"], "min");

        let back: Candle = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_count_accepts_number() {
        let mut json = serde_json::to_value(candle(0, 1, 1, 1, 1, 1, 7)).unwrap();
        json["count"] = serde_json::json!(7);
        let back: Candle = serde_json::from_value(json).unwrap();
        assert_eq!(back.count, 7);
    }
}
