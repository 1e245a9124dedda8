//! Service configuration
//!
//! Every knob has a default; `from_env` overrides from `MARKET_DATA_*`
//! variables. Unparseable values fall back to the default.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::dispatcher::DispatcherConfig;
use crate::outbound::OutboundConfig;
use crate::trades::DEFAULT_HISTORY;

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
    pub outbound: OutboundConfig,
    /// Trades kept per instrument for the trades channel.
    pub trade_history: usize,
    pub snapshot_path: PathBuf,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            cache: CacheConfig::default(),
            outbound: OutboundConfig::default(),
            trade_history: DEFAULT_HISTORY,
            snapshot_path: PathBuf::from("market-data-snapshot.json"),
        }
    }
}

impl MarketDataConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults overridden through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut config = Self::default();

        let d = &mut config.dispatcher;
        d.page_size = vars.usize("MARKET_DATA_PAGE_SIZE", d.page_size).max(1);
        d.checkpoint_interval = vars.secs("MARKET_DATA_CHECKPOINT_SECS", d.checkpoint_interval);
        d.initial_fetch_window_ms =
            vars.i64("MARKET_DATA_INITIAL_FETCH_WINDOW_MS", d.initial_fetch_window_ms);
        d.max_catch_up_ms = vars.i64("MARKET_DATA_MAX_CATCH_UP_MS", d.max_catch_up_ms);
        d.watch_retry_delay = vars.millis("MARKET_DATA_WATCH_RETRY_MS", d.watch_retry_delay);

        let c = &mut config.cache;
        c.truncate_interval = vars.secs("MARKET_DATA_TRUNCATE_SECS", c.truncate_interval);
        c.ingester.dedup_window = vars.usize("MARKET_DATA_DEDUP_WINDOW", c.ingester.dedup_window);

        let o = &mut config.outbound;
        o.queue_capacity = vars.usize("MARKET_DATA_CLIENT_QUEUE", o.queue_capacity).max(1);
        o.max_subscriptions_per_client =
            vars.usize("MARKET_DATA_MAX_SUBSCRIPTIONS", o.max_subscriptions_per_client);

        config.trade_history = vars.usize("MARKET_DATA_TRADE_HISTORY", config.trade_history);
        if let Some(path) = vars.str("MARKET_DATA_SNAPSHOT_PATH") {
            config.snapshot_path = PathBuf::from(path);
        }
        config
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn str(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.str(name)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.str(name)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    fn i64(&self, name: &str, default: i64) -> i64 {
        self.str(name)
            .and_then(|s| s.parse().ok())
            .filter(|v: &i64| *v > 0)
            .unwrap_or(default)
    }

    fn secs(&self, name: &str, default: Duration) -> Duration {
        Duration::from_secs(self.u64(name, default.as_secs()).max(1))
    }

    fn millis(&self, name: &str, default: Duration) -> Duration {
        Duration::from_millis(self.u64(name, default.as_millis() as u64))
    }
}
