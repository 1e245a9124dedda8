//! Property tests for candle aggregation
//!
//! - Bucket starts never go backwards for time-ordered trades
//! - Volume and count never shrink within a bucket
//! - Snapshot, reload, replay the rest == replay everything

use std::collections::BTreeMap;
use std::sync::Arc;

use market_data::cache::{AggregationCache, ApplyOutcome, CacheConfig};
use market_data::candles::Candle;
use market_data::dispatcher::FrameCheckpoint;
use market_data::metrics::ServiceMetrics;
use market_data::resolution::TimeUnit;
use market_data::snapshot::SnapshotStore;
use market_data::timeframe::TimeFrames;
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;
use types::ids::MarketId;
use types::trade::Trade;

const T0: i64 = 1_708_041_600_000;

fn cache_at(dir: &TempDir) -> AggregationCache {
    AggregationCache::new(
        CacheConfig::default(),
        SnapshotStore::new(dir.path().join("snapshot.json")),
        Arc::new(ServiceMetrics::new()),
    )
}

/// Time-ordered trades built from (gap, price cents, amount) steps.
fn trades(steps: &[(i64, i64, i64)]) -> Vec<Trade> {
    let mut at = T0;
    steps
        .iter()
        .map(|&(gap, cents, amount)| {
            at += gap;
            Trade::new(
                MarketId::new("BTC/USDT"),
                Decimal::new(cents, 2),
                Decimal::from(amount),
                at,
            )
        })
        .collect()
}

fn steps() -> impl Strategy<Value = Vec<(i64, i64, i64)>> {
    prop::collection::vec((0i64..120_000, 1i64..1_000_000, 1i64..1_000), 1..60)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn buckets_advance_and_totals_grow(steps in steps()) {
        let dir = TempDir::new().unwrap();
        let cache = cache_at(&dir);
        let trades = trades(&steps);
        let now = trades.last().map(|t| t.created_at).unwrap_or(T0);

        let mut last: BTreeMap<(u32, TimeUnit), Candle> = BTreeMap::new();
        for trade in &trades {
            let mut updated = Vec::new();
            let outcome = cache.apply_trade(trade, now, |candles| updated.extend_from_slice(candles));
            prop_assert!(matches!(outcome, ApplyOutcome::Applied(_)));

            for candle in updated {
                prop_assert!(candle.low <= candle.open && candle.open <= candle.high);
                prop_assert!(candle.low <= candle.close && candle.close <= candle.high);
                let key = (candle.duration, candle.unit);
                if let Some(previous) = last.get(&key) {
                    prop_assert!(candle.timestamp_ms >= previous.timestamp_ms);
                    if candle.timestamp_ms == previous.timestamp_ms {
                        prop_assert!(candle.volume >= previous.volume);
                        prop_assert!(candle.count > previous.count);
                    }
                }
                last.insert(key, candle);
            }
        }
    }

    #[test]
    fn snapshot_then_replay_matches_full_replay(steps in steps(), split in 0usize..60) {
        let trades = trades(&steps);
        let split = split.min(trades.len());
        let now = trades.last().map(|t| t.created_at).unwrap_or(T0);

        let full_dir = TempDir::new().unwrap();
        let full = cache_at(&full_dir);
        for trade in &trades {
            full.apply_trade(trade, now, |_| {});
        }

        let dir = TempDir::new().unwrap();
        let before = cache_at(&dir);
        for trade in &trades[..split] {
            before.apply_trade(trade, now, |_| {});
        }
        let snapshot = before.capture(&TimeFrames::new());
        before.persist(&snapshot).unwrap();

        let after = cache_at(&dir);
        prop_assert!(after.restore().is_some());
        for trade in &trades[split..] {
            after.apply_trade(trade, now, |_| {});
        }

        prop_assert_eq!(after.flatten(), full.flatten());
    }

    #[test]
    fn single_trade_bucket_is_flat(cents in 1i64..10_000_000, amount in 1i64..1_000) {
        let dir = TempDir::new().unwrap();
        let cache = cache_at(&dir);
        let trade = trades(&[(0, cents, amount)]).remove(0);
        cache.apply_trade(&trade, T0, |_| {});

        for candle in cache.flatten() {
            let price = Decimal::new(cents, 2);
            prop_assert_eq!((candle.open, candle.high, candle.low, candle.close), (price, price, price, price));
            prop_assert_eq!(candle.count, 1);
            prop_assert_eq!(candle.volume, Decimal::from(amount));
        }
        prop_assert_eq!(cache.flatten().len(), 16);
    }
}
