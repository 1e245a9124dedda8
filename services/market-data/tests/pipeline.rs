//! End-to-end tests for the market data pipeline
//!
//! Each test boots the full service against an in-memory trade log and a
//! snapshot file in a temp directory:
//! - OHLCV aggregation of live trades
//! - Empty 24h summary
//! - Subscribe → INIT → single UPDATE
//! - Disconnect cleanup across channels
//! - Restart resuming from the snapshot

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use market_data::channels::{Channel, ChannelKind};
use market_data::clock::ManualClock;
use market_data::outbound::{
    DeliveryError, EventType, MessageWriter, OutboundMessage, WebsocketMessage,
};
use market_data::resolution::{TimeUnit, DAY_MS, MINUTE_MS};
use market_data::trade_log::MemoryTradeLog;
use market_data::{MarketDataConfig, MarketDataRuntime, MarketDataService};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::mpsc;
use types::ids::MarketId;
use types::trade::Trade;

/// 2024-02-16T00:00:00Z
const T0: i64 = 1_708_041_600_000;

fn btc() -> MarketId {
    MarketId::new("BTC/USDT")
}

fn trade(price: i64, at: i64) -> Trade {
    Trade::new(btc(), Decimal::from(price), Decimal::ONE, at)
}

fn config(dir: &TempDir) -> MarketDataConfig {
    MarketDataConfig {
        snapshot_path: dir.path().join("market-data.json"),
        ..MarketDataConfig::default()
    }
}

async fn boot(dir: &TempDir, log: &Arc<MemoryTradeLog>, clock: &Arc<ManualClock>) -> MarketDataRuntime {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    MarketDataService::bootstrap(config(dir), log.clone(), clock.clone()).await
}

/// Poll until `check` passes or a second has gone by.
async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

async fn recv(rx: &mut mpsc::Receiver<OutboundMessage>) -> WebsocketMessage {
    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("message within a second")
        .expect("queue open");
    serde_json::from_str(&message.payload).unwrap()
}

#[tokio::test]
async fn test_live_trades_aggregate_into_one_minute_candle() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    let clock = Arc::new(ManualClock::new(T0 + 59_000));
    let runtime = boot(&dir, &log, &clock).await;

    for (i, price) in [100, 105, 95, 102].into_iter().enumerate() {
        log.insert(trade(price, T0 + 1_000 * (i as i64 + 1)));
    }
    let service = runtime.service.clone();
    assert!(eventually(|| service.get_24h(&btc()).count == 4).await);

    let candles = service
        .get_ohlcv(&btc(), 1, TimeUnit::Min, None, None)
        .unwrap();
    assert_eq!(candles.len(), 1);
    let c = &candles[0];
    assert_eq!(c.timestamp_ms, T0);
    assert_eq!(
        (c.open, c.high, c.low, c.close),
        (
            Decimal::from(100),
            Decimal::from(105),
            Decimal::from(95),
            Decimal::from(102)
        )
    );
    assert_eq!(c.count, 4);
    assert_eq!(c.volume, Decimal::from(4));
    assert_eq!(c.volume_by_quote, Decimal::from(402));
    assert_eq!((c.open_time, c.close_time), (T0 + 1_000, T0 + 4_000));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_quiet_market_gives_zero_volume_summary() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    // Only trade is older than the trailing window
    log.seed(trade(100, T0 - DAY_MS - MINUTE_MS));
    let clock = Arc::new(ManualClock::new(T0));
    let runtime = boot(&dir, &log, &clock).await;

    let summary = runtime.service.get_24h(&btc());
    assert_eq!(summary.volume, Decimal::ZERO);
    assert_eq!(summary.count, 0);
    assert_eq!((summary.duration, summary.unit), (24, TimeUnit::Hour));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_gets_init_then_exactly_one_update() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    log.seed(trade(99, T0 - 5_000));
    let clock = Arc::new(ManualClock::new(T0 + 30_000));
    let runtime = boot(&dir, &log, &clock).await;

    let (client, mut rx) = runtime.service.connect();
    runtime
        .service
        .subscribe(client, &Channel::ohlcv(btc(), 1, TimeUnit::Min), None, None)
        .unwrap();

    let init = recv(&mut rx).await;
    assert_eq!(init.channel, ChannelKind::Ohlcv);
    assert_eq!(init.event.event_type, EventType::Init);
    assert_eq!(init.event.payload.as_array().map(Vec::len), Some(1));

    log.insert(trade(101, T0 + 10_000));
    let update = recv(&mut rx).await;
    assert_eq!(update.event.event_type, EventType::Update);
    assert_eq!(update.event.payload["timestampMs"], T0);
    assert_eq!(update.event.payload["close"], "101");
    assert_eq!(update.event.payload["closeTime"], T0 + 10_000);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_leaves_every_channel() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    let clock = Arc::new(ManualClock::new(T0));
    let runtime = boot(&dir, &log, &clock).await;
    let service = &runtime.service;

    let (client, _rx) = service.connect();
    let channels = [
        Channel::ohlcv(btc(), 1, TimeUnit::Min),
        Channel::ohlcv(btc(), 1, TimeUnit::Hour),
        Channel::trades(btc()),
    ];
    for channel in &channels {
        service.subscribe(client, channel, None, None).unwrap();
    }
    assert_eq!(service.registry().channels_of(client).len(), 3);

    assert!(service.disconnect(client));
    for channel in &channels {
        assert!(!service.registry().subscribers(&channel.id()).contains(&client));
    }
    assert!(!service.disconnect(client));

    runtime.shutdown().await;
}

struct FailingWriter;

#[async_trait]
impl MessageWriter for FailingWriter {
    async fn write(&mut self, _message: &OutboundMessage) -> Result<(), DeliveryError> {
        Err(DeliveryError::Write("connection reset".into()))
    }
}

#[tokio::test]
async fn test_broken_connection_is_cleaned_up() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    let clock = Arc::new(ManualClock::new(T0));
    let runtime = boot(&dir, &log, &clock).await;
    let service = runtime.service.clone();

    let (client, writer) = service.connect_writer(FailingWriter);
    service
        .subscribe(client, &Channel::trades(btc()), None, None)
        .unwrap();

    writer.await.unwrap();
    assert!(service.registry().channels_of(client).is_empty());
    assert_eq!(service.registry().client_count(), 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_fetches_only_the_downtime() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    log.seed(trade(100, T0 - 5 * MINUTE_MS));
    let clock = Arc::new(ManualClock::new(T0));

    let first = boot(&dir, &log, &clock).await;
    assert_eq!(first.service.get_24h(&btc()).count, 1);
    first.shutdown().await;

    // Down for ten minutes; one trade written meanwhile
    log.seed(trade(110, T0 + 5 * MINUTE_MS));
    log.clear_requests();
    clock.advance(10 * MINUTE_MS);

    let second = boot(&dir, &log, &clock).await;
    let first_fetch = log.requests()[0];
    assert_eq!(
        (first_fetch.from, first_fetch.to),
        (T0, T0 + 10 * MINUTE_MS)
    );

    // Restored candle plus the one caught up
    let summary = second.service.get_24h(&btc());
    assert_eq!(summary.count, 2);
    assert_eq!(summary.open, Decimal::from(100));
    assert_eq!(summary.close, Decimal::from(110));

    second.shutdown().await;
}

#[tokio::test]
async fn test_restart_does_not_count_live_trade_twice() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    let clock = Arc::new(ManualClock::new(T0));

    let first = boot(&dir, &log, &clock).await;
    log.insert(trade(100, T0 + 1_000));
    let service = first.service.clone();
    assert!(eventually(|| service.get_24h(&btc()).count == 1).await);
    first.shutdown().await;

    clock.advance(10 * MINUTE_MS);
    let second = boot(&dir, &log, &clock).await;

    // The resume fetch starts at the live trade's time and reads it again
    assert!(log.requests().iter().any(|r| r.from == T0 + 1_000));
    let summary = second.service.get_24h(&btc());
    assert_eq!(summary.count, 1);
    assert_eq!(summary.volume, Decimal::ONE);
    assert_eq!(second.metrics.export()["trades_duplicate"], 1);

    second.shutdown().await;
}

#[tokio::test]
async fn test_feed_failure_recovers() {
    let dir = TempDir::new().unwrap();
    let log = Arc::new(MemoryTradeLog::new());
    let clock = Arc::new(ManualClock::new(T0 + 30_000));
    let mut config = config(&dir);
    config.dispatcher.watch_retry_delay = Duration::from_millis(10);
    let runtime = MarketDataService::bootstrap(config, log.clone(), clock.clone()).await;

    assert!(eventually(|| log.open_feeds() == 1).await);
    log.break_feeds("cursor lost");
    assert!(eventually(|| log.open_feeds() == 1).await);

    log.insert(trade(100, T0 + 1_000));
    let service = runtime.service.clone();
    assert!(eventually(|| service.get_24h(&btc()).count == 1).await);
    assert!(runtime.metrics.export()["feed_restarts"] >= 1);

    runtime.shutdown().await;
}
