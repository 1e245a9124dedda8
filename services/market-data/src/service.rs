//! Market data service facade
//!
//! Owns the client-facing side of the pipeline: it receives trades from the
//! dispatcher, folds them into the aggregation cache, and fans candle and
//! trade updates out to subscribed clients.
//!
//! Lock order:
//! - ohlcv channel: cache, then registry
//! - trades channel: recent trades, then registry
//!
//! Subscribing reads the INIT payload and registers while holding the same
//! lock the matching broadcast runs under, so a new subscriber sees every
//! update after its snapshot and nothing before it twice.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::ids::MarketId;
use types::trade::Trade;

use crate::cache::{AggregationCache, ApplyOutcome, QueryError};
use crate::candles::Candle;
use crate::channels::{self, Channel, ChannelKind, RequestType, SubscribeError};
use crate::clock::Clock;
use crate::config::MarketDataConfig;
use crate::dispatcher::{FrameCheckpoint, TradeDispatcher, TradeSubscriber};
use crate::metrics::ServiceMetrics;
use crate::outbound::{
    spawn_writer, ClientId, DeliveryError, EventType, MessageWriter, OutboundMessage,
    WebsocketMessage,
};
use crate::registry::SubscriptionRegistry;
use crate::resolution::TimeUnit;
use crate::snapshot::SnapshotStore;
use crate::trade_log::{TradeChangeEvent, TradeLog};
use crate::trades::TradeHistory;

pub struct MarketDataService {
    cache: Arc<AggregationCache>,
    registry: SubscriptionRegistry,
    recent: Mutex<TradeHistory>,
    clock: Arc<dyn Clock>,
    metrics: Arc<ServiceMetrics>,
}

impl MarketDataService {
    pub fn new(
        config: &MarketDataConfig,
        cache: Arc<AggregationCache>,
        clock: Arc<dyn Clock>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            cache,
            registry: SubscriptionRegistry::new(config.outbound.clone(), Arc::clone(&metrics)),
            recent: Mutex::new(TradeHistory::new(config.trade_history)),
            clock,
            metrics,
        }
    }

    /// Wire up cache, service and dispatcher, then start ingesting.
    pub async fn bootstrap(
        config: MarketDataConfig,
        log: Arc<dyn TradeLog>,
        clock: Arc<dyn Clock>,
    ) -> MarketDataRuntime {
        let metrics = Arc::new(ServiceMetrics::new());
        let cache = Arc::new(AggregationCache::new(
            config.cache.clone(),
            SnapshotStore::new(config.snapshot_path.clone()),
            Arc::clone(&metrics),
        ));
        let service = Arc::new(Self::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));
        let checkpoint: Arc<dyn FrameCheckpoint> = cache.clone();
        let dispatcher = Arc::new(
            TradeDispatcher::new(
                config.dispatcher.clone(),
                log,
                checkpoint,
                Arc::clone(&clock),
                Arc::clone(&metrics),
            )
            .with_subscriber(service.clone()),
        );

        dispatcher.start().await;
        let truncation = cache.spawn_truncation(clock);
        info!(snapshot = %config.snapshot_path.display(), "Market data service started");

        MarketDataRuntime {
            service,
            dispatcher,
            cache,
            metrics,
            truncation,
        }
    }

    fn lock_recent(&self) -> MutexGuard<'_, TradeHistory> {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a client and hand back the receiving end of its queue.
    pub fn connect(&self) -> (ClientId, mpsc::Receiver<OutboundMessage>) {
        self.registry.register()
    }

    /// Register a client whose queue is drained into `writer`. The client is
    /// disconnected once the writer fails or the queue closes.
    pub fn connect_writer<W>(self: &Arc<Self>, writer: W) -> (ClientId, JoinHandle<()>)
    where
        W: MessageWriter + 'static,
    {
        let (id, rx) = self.connect();
        let service: Weak<Self> = Arc::downgrade(self);
        let task = spawn_writer(id, rx, writer, move |client| {
            if let Some(service) = service.upgrade() {
                service.disconnect(client);
            }
        });
        (id, task)
    }

    /// Drop every subscription of a client. Returns false if it was
    /// already gone.
    pub fn disconnect(&self, client: ClientId) -> bool {
        self.registry.unsubscribe_all(client).is_some()
    }

    /// Handle one raw client message. Failures are reported to the client
    /// as an ERROR event and returned.
    pub fn handle_message(&self, client: ClientId, text: &str) -> Result<(), SubscribeError> {
        let result = channels::parse_request(text).and_then(|request| match request.kind {
            RequestType::Subscribe => self.subscribe(client, &request.channel, request.from, request.to),
            RequestType::Unsubscribe => {
                self.unsubscribe(client, &request.channel);
                Ok(())
            }
        });

        if let Err(e) = &result {
            debug!(client, error = %e, "Rejected client request");
            let kind = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| serde_json::from_value::<ChannelKind>(v["channel"].clone()).ok())
                .unwrap_or(ChannelKind::Ohlcv);
            self.send_error(client, kind, e);
        }
        result
    }

    /// Join a channel and receive its INIT snapshot.
    ///
    /// The INIT message is queued before this returns.
    pub fn subscribe(
        &self,
        client: ClientId,
        channel: &Channel,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<(), SubscribeError> {
        let channel_id = channel.id();
        match channel {
            Channel::Ohlcv {
                instrument,
                duration,
                unit,
            } => {
                let view = self.cache.read();
                let candles =
                    view.ohlcv(instrument, *duration, *unit, from, to, self.clock.now_ms())?;
                self.registry.subscribe(&channel_id, client)?;
                self.send_init(client, ChannelKind::Ohlcv, &candles);
                drop(view);
            }
            Channel::Trades { instrument } => {
                let recent = self.lock_recent();
                let trades = recent.recent(instrument);
                self.registry.subscribe(&channel_id, client)?;
                self.send_init(client, ChannelKind::Trades, &trades);
                drop(recent);
            }
        }
        info!(client, channel = %channel_id, "Client subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, client: ClientId, channel: &Channel) -> bool {
        self.registry.unsubscribe(&channel.id(), client)
    }

    /// Candles of one resolution, ascending. See [`crate::cache::CacheView::ohlcv`].
    pub fn get_ohlcv(
        &self,
        instrument: &MarketId,
        duration: u32,
        unit: TimeUnit,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<Candle>, QueryError> {
        self.cache
            .ohlcv(instrument, duration, unit, from, to, self.clock.now_ms())
    }

    /// Trailing 24 hour summary; zero-volume when there were no trades.
    pub fn get_24h(&self, instrument: &MarketId) -> Candle {
        self.cache.trailing_24h(instrument, self.clock.now_ms())
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ServiceMetrics> {
        &self.metrics
    }

    /// Retained recent trades of an instrument, newest first.
    pub fn recent_trades(&self, instrument: &MarketId) -> Vec<Trade> {
        self.lock_recent().recent(instrument)
    }

    fn send_init<T: Serialize>(&self, client: ClientId, kind: ChannelKind, payload: &T) {
        self.send(client, kind, EventType::Init, payload);
    }

    fn send_error(&self, client: ClientId, kind: ChannelKind, error: &SubscribeError) {
        self.send(client, kind, EventType::Error, &error.to_string());
    }

    fn send<T: Serialize>(&self, client: ClientId, kind: ChannelKind, event: EventType, payload: &T) {
        let result = WebsocketMessage::encode(kind, event, payload)
            .and_then(|text| self.registry.send_to(client, text));
        match result {
            Ok(()) => {}
            Err(DeliveryError::QueueFull) => {
                warn!(client, channel = %kind, "Outbound queue full, dropping message")
            }
            Err(e) => debug!(client, channel = %kind, error = %e, "Message not delivered"),
        }
    }

    fn broadcast<T: Serialize>(&self, channel_id: &str, kind: ChannelKind, payload: &T) {
        match WebsocketMessage::encode(kind, EventType::Update, payload) {
            Ok(text) => {
                self.registry.broadcast(channel_id, text);
            }
            Err(e) => warn!(channel = channel_id, error = %e, "Failed to encode update"),
        }
    }

    fn record_recent(&self, trade: &Trade, broadcast: bool) {
        let mut recent = self.lock_recent();
        if recent.record(trade) && broadcast {
            let channel_id = channels::trades_channel_id(&trade.instrument_key);
            self.broadcast(&channel_id, ChannelKind::Trades, &[trade]);
        }
    }
}

impl TradeSubscriber for MarketDataService {
    /// Catch-up trades update the cache silently.
    fn on_trade(&self, trade: &Trade) {
        let outcome = self.cache.apply_trade(trade, self.clock.now_ms(), |_| {});
        if let ApplyOutcome::Applied(_) = outcome {
            self.record_recent(trade, false);
        }
    }

    /// Live inserts update the cache and are broadcast to subscribers.
    fn on_change(&self, event: &TradeChangeEvent) {
        if !event.is_insert() {
            debug!(operation = ?event.operation_type, trade_id = %event.full_document.id, "Ignoring non-insert change");
            return;
        }
        let trade = &event.full_document;
        let outcome = self.cache.apply_trade(trade, self.clock.now_ms(), |updated| {
            for candle in updated {
                let channel_id =
                    channels::ohlcv_channel_id(&candle.instrument_key, candle.duration, candle.unit);
                self.broadcast(&channel_id, ChannelKind::Ohlcv, candle);
            }
        });
        if let ApplyOutcome::Applied(_) = outcome {
            self.record_recent(trade, true);
        }
    }
}

/// Running pipeline returned by [`MarketDataService::bootstrap`].
pub struct MarketDataRuntime {
    pub service: Arc<MarketDataService>,
    pub dispatcher: Arc<TradeDispatcher>,
    pub cache: Arc<AggregationCache>,
    pub metrics: Arc<ServiceMetrics>,
    truncation: JoinHandle<()>,
}

impl MarketDataRuntime {
    /// Stop background work and write a final checkpoint.
    pub async fn shutdown(self) {
        self.truncation.abort();
        self.dispatcher.shutdown().await;
        info!("Market data service stopped");
    }
}
