use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use market_data::cache::{AggregationCache, CacheConfig};
use market_data::metrics::ServiceMetrics;
use market_data::snapshot::SnapshotStore;
use rust_decimal::Decimal;
use types::ids::MarketId;
use types::trade::Trade;

const T0: i64 = 1_708_041_600_000;

fn apply_trades(c: &mut Criterion) {
    let dir = std::env::temp_dir().join("market-data-bench.json");
    let trades: Vec<Trade> = (0..10_000i64)
        .map(|i| {
            Trade::new(
                MarketId::new("BTC/USDT"),
                Decimal::new(5_000_000 + i % 997, 2),
                Decimal::new(i % 50 + 1, 1),
                T0 + i * 250,
            )
        })
        .collect();
    let now = T0 + 10_000 * 250;

    c.bench_function("apply_10k_trades", |b| {
        b.iter(|| {
            let cache = AggregationCache::new(
                CacheConfig::default(),
                SnapshotStore::new(&dir),
                Arc::new(ServiceMetrics::new()),
            );
            for trade in &trades {
                cache.apply_trade(black_box(trade), now, |_| {});
            }
            cache
        })
    });

    let cache = AggregationCache::new(
        CacheConfig::default(),
        SnapshotStore::new(&dir),
        Arc::new(ServiceMetrics::new()),
    );
    for trade in &trades {
        cache.apply_trade(trade, now, |_| {});
    }
    let btc = MarketId::new("BTC/USDT");
    c.bench_function("trailing_24h", |b| {
        b.iter(|| cache.trailing_24h(black_box(&btc), now))
    });
}

criterion_group!(benches, apply_trades);
criterion_main!(benches);
