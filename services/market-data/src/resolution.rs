//! Candle resolutions
//!
//! Every trade updates one candle per resolution in [`RESOLUTIONS`].
//! Each resolution carries its own retention window; buckets older than
//! `now - retention` are truncated from the cache.
//!
//! Bucket boundaries:
//! - `sec`, `min`, `hour`, `day` floor on the Unix epoch
//! - `week` floors to Monday 00:00 UTC
//! - `month` and `year` floor to calendar boundaries (UTC)
//!
//! All timestamps are Unix milliseconds.

use std::fmt;

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;
pub const WEEK_MS: i64 = 7 * DAY_MS;
const YEAR_MS: i64 = 365 * DAY_MS;

/// 1970-01-01 was a Thursday; the Monday before it is three days earlier.
const MONDAY_EPOCH_MS: i64 = -3 * DAY_MS;

/// Time unit of a candle resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Sec,
    Min,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Sec => "sec",
            TimeUnit::Min => "min",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
            TimeUnit::Week => "week",
            TimeUnit::Month => "month",
            TimeUnit::Year => "year",
        }
    }

    /// Parse a unit name. Accepts the short `yr` alias used by older clients.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sec" => Some(TimeUnit::Sec),
            "min" => Some(TimeUnit::Min),
            "hour" => Some(TimeUnit::Hour),
            "day" => Some(TimeUnit::Day),
            "week" => Some(TimeUnit::Week),
            "month" => Some(TimeUnit::Month),
            "year" | "yr" => Some(TimeUnit::Year),
            _ => None,
        }
    }

    /// Width of one unit in millis, for units of fixed length.
    fn fixed_millis(&self) -> Option<i64> {
        match self {
            TimeUnit::Sec => Some(SECOND_MS),
            TimeUnit::Min => Some(MINUTE_MS),
            TimeUnit::Hour => Some(HOUR_MS),
            TimeUnit::Day => Some(DAY_MS),
            TimeUnit::Week => Some(WEEK_MS),
            TimeUnit::Month | TimeUnit::Year => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the resolution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub duration: u32,
    pub unit: TimeUnit,
    /// How long buckets of this resolution are kept (millis).
    pub retention_ms: i64,
}

/// Resolutions maintained for every instrument.
pub static RESOLUTIONS: [Resolution; 16] = [
    Resolution::new(1, TimeUnit::Sec, HOUR_MS),
    Resolution::new(1, TimeUnit::Min, DAY_MS),
    Resolution::new(5, TimeUnit::Min, 3 * DAY_MS),
    Resolution::new(15, TimeUnit::Min, 7 * DAY_MS),
    Resolution::new(30, TimeUnit::Min, 7 * DAY_MS),
    Resolution::new(1, TimeUnit::Hour, 7 * DAY_MS),
    Resolution::new(2, TimeUnit::Hour, 30 * DAY_MS),
    Resolution::new(4, TimeUnit::Hour, 30 * DAY_MS),
    Resolution::new(12, TimeUnit::Hour, 30 * DAY_MS),
    Resolution::new(1, TimeUnit::Day, 30 * DAY_MS),
    Resolution::new(1, TimeUnit::Week, YEAR_MS),
    Resolution::new(1, TimeUnit::Month, 2 * YEAR_MS),
    Resolution::new(3, TimeUnit::Month, 2 * YEAR_MS),
    Resolution::new(6, TimeUnit::Month, 2 * YEAR_MS),
    Resolution::new(9, TimeUnit::Month, 2 * YEAR_MS),
    Resolution::new(1, TimeUnit::Year, 2 * YEAR_MS),
];

impl Resolution {
    pub const fn new(duration: u32, unit: TimeUnit, retention_ms: i64) -> Self {
        Self {
            duration,
            unit,
            retention_ms,
        }
    }

    /// All maintained resolutions.
    pub fn all() -> &'static [Resolution] {
        &RESOLUTIONS
    }

    /// Find the table row for `(duration, unit)`.
    pub fn lookup(duration: u32, unit: TimeUnit) -> Option<&'static Resolution> {
        RESOLUTIONS
            .iter()
            .find(|r| r.duration == duration && r.unit == unit)
    }

    /// The 1-minute resolution backing the trailing 24h summary.
    pub fn minute() -> &'static Resolution {
        &RESOLUTIONS[1]
    }

    /// Longest retention across the table.
    pub fn max_retention_ms() -> i64 {
        RESOLUTIONS
            .iter()
            .map(|r| r.retention_ms)
            .max()
            .unwrap_or(2 * YEAR_MS)
    }

    /// Oldest bucket start still inside the retention window.
    pub fn retention_cutoff(&self, now_ms: i64) -> i64 {
        now_ms - self.retention_ms
    }

    /// Floor a timestamp to the start of its bucket.
    pub fn bucket_start(&self, ts_ms: i64) -> i64 {
        let duration = i64::from(self.duration.max(1));
        match self.unit.fixed_millis() {
            Some(unit_ms) if self.unit == TimeUnit::Week => {
                let width = unit_ms * duration;
                MONDAY_EPOCH_MS + (ts_ms - MONDAY_EPOCH_MS).div_euclid(width) * width
            }
            Some(unit_ms) => {
                let width = unit_ms * duration;
                ts_ms.div_euclid(width) * width
            }
            None => self
                .calendar_floor(ts_ms, duration)
                .unwrap_or_else(|| ts_ms.div_euclid(DAY_MS) * DAY_MS),
        }
    }

    fn calendar_floor(&self, ts_ms: i64, duration: i64) -> Option<i64> {
        let dt = Utc.timestamp_millis_opt(ts_ms).single()?;
        let (year, month) = match self.unit {
            TimeUnit::Month => {
                let index = i64::from(dt.year()) * 12 + i64::from(dt.month0());
                let floored = index - index.rem_euclid(duration);
                (floored.div_euclid(12), floored.rem_euclid(12) + 1)
            }
            _ => {
                let year = i64::from(dt.year());
                (year - year.rem_euclid(duration), 1)
            }
        };
        let start = Utc
            .with_ymd_and_hms(i32::try_from(year).ok()?, u32::try_from(month).ok()?, 1, 0, 0, 0)
            .single()?;
        Some(start.timestamp_millis())
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.duration, self.unit)
    }
}
