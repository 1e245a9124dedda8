//! Subscription channels and client requests
//!
//! Two channel kinds:
//! - `ohlcv`: candles of one instrument at one resolution,
//!   id `ohlcv:BASE/QUOTE::<duration>::<unit>`
//! - `trades`: executed trades of one instrument, id `trades:BASE/QUOTE`
//!
//! Ids carry the kind as a prefix and instrument keys cannot contain `:`,
//! so ids of different channels never collide.
//!
//! Client requests arrive as
//! `{"channel": "ohlcv", "event": {"type": "SUBSCRIBE", "payload": {...}}}`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use types::ids::MarketId;

use crate::cache::QueryError;
use crate::resolution::{Resolution, TimeUnit};

/// Channel kind, as it appears in the message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Ohlcv,
    Trades,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Ohlcv => "ohlcv",
            ChannelKind::Trades => "trades",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete subscribable channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Ohlcv {
        instrument: MarketId,
        duration: u32,
        unit: TimeUnit,
    },
    Trades {
        instrument: MarketId,
    },
}

impl Channel {
    pub fn ohlcv(instrument: MarketId, duration: u32, unit: TimeUnit) -> Self {
        Channel::Ohlcv {
            instrument,
            duration,
            unit,
        }
    }

    pub fn trades(instrument: MarketId) -> Self {
        Channel::Trades { instrument }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::Ohlcv { .. } => ChannelKind::Ohlcv,
            Channel::Trades { .. } => ChannelKind::Trades,
        }
    }

    pub fn instrument(&self) -> &MarketId {
        match self {
            Channel::Ohlcv { instrument, .. } | Channel::Trades { instrument } => instrument,
        }
    }

    /// Registry key for this channel.
    pub fn id(&self) -> String {
        match self {
            Channel::Ohlcv {
                instrument,
                duration,
                unit,
            } => ohlcv_channel_id(instrument, *duration, *unit),
            Channel::Trades { instrument } => trades_channel_id(instrument),
        }
    }
}

pub fn ohlcv_channel_id(instrument: &MarketId, duration: u32, unit: TimeUnit) -> String {
    format!("{}:{}::{}::{}", ChannelKind::Ohlcv, instrument, duration, unit)
}

pub fn trades_channel_id(instrument: &MarketId) -> String {
    format!("{}:{}", ChannelKind::Trades, instrument)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid instrument key: {0}")]
    InvalidInstrument(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown resolution: {duration} {unit}")]
    UnknownResolution { duration: u32, unit: String },

    #[error("max subscriptions ({0}) reached")]
    LimitReached(usize),

    #[error("client not found: {0}")]
    UnknownClient(u64),

    #[error(transparent)]
    Query(#[from] QueryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestType {
    Subscribe,
    Unsubscribe,
}

/// Subscription parameters sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionPayload {
    pub instrument_key: Option<String>,
    pub duration: Option<u32>,
    pub units: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEvent {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub payload: SubscriptionPayload,
}

/// Raw client message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub channel: ChannelKind,
    pub event: RequestEvent,
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestType,
    pub channel: Channel,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl SubscriptionPayload {
    /// Resolve the payload into a channel of the given kind.
    pub fn to_channel(&self, kind: ChannelKind) -> Result<Channel, SubscribeError> {
        let key = self
            .instrument_key
            .as_deref()
            .ok_or(SubscribeError::MissingField("instrumentKey"))?;
        let instrument = MarketId::try_new(key)
            .ok_or_else(|| SubscribeError::InvalidInstrument(key.to_string()))?;

        match kind {
            ChannelKind::Trades => Ok(Channel::trades(instrument)),
            ChannelKind::Ohlcv => {
                let duration = self.duration.ok_or(SubscribeError::MissingField("duration"))?;
                let units = self.units.as_deref().ok_or(SubscribeError::MissingField("units"))?;
                let unknown = || SubscribeError::UnknownResolution {
                    duration,
                    unit: units.to_string(),
                };
                let unit = TimeUnit::parse(units).ok_or_else(unknown)?;
                Resolution::lookup(duration, unit).ok_or_else(unknown)?;
                Ok(Channel::ohlcv(instrument, duration, unit))
            }
        }
    }
}

/// Parse and validate a raw client message.
pub fn parse_request(json: &str) -> Result<Request, SubscribeError> {
    let raw: ClientRequest =
        serde_json::from_str(json).map_err(|e| SubscribeError::Malformed(e.to_string()))?;
    let channel = raw.event.payload.to_channel(raw.channel)?;
    Ok(Request {
        kind: raw.event.kind,
        channel,
        from: raw.event.payload.from,
        to: raw.event.payload.to,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids() {
        let btc = MarketId::new("BTC/USDT");
        assert_eq!(
            Channel::ohlcv(btc.clone(), 5, TimeUnit::Min).id(),
            "ohlcv:BTC/USDT::5::min"
        );
        assert_eq!(Channel::trades(btc).id(), "trades:BTC/USDT");
    }

    #[test]
    fn test_ids_of_different_kinds_never_collide() {
        // Would name the same registry entry as an ohlcv channel without the kind prefix
        assert!(MarketId::try_new("BTC/USDT::1::min").is_none());
        let btc = MarketId::new("BTC/USDT");
        let ohlcv = Channel::ohlcv(btc.clone(), 1, TimeUnit::Min).id();
        assert_ne!(ohlcv, Channel::trades(btc.clone()).id());
        assert_eq!(ohlcv, ohlcv_channel_id(&btc, 1, TimeUnit::Min));
        assert!(matches!(
            parse_request(r#"{"channel":"trades","event":{"type":"SUBSCRIBE","payload":{"instrumentKey":"BTC/USDT::1::min"}}}"#),
            Err(SubscribeError::InvalidInstrument(_))
        ));
    }

    #[test]
    fn test_parse_ohlcv_subscribe() {
        let req = parse_request(
            r#"{"channel":"ohlcv","event":{"type":"SUBSCRIBE","payload":
                {"instrumentKey":"ETH/USDC","duration":1,"units":"hour","from":10,"to":20}}}"#,
        )
        .unwrap();

        assert_eq!(req.kind, RequestType::Subscribe);
        assert_eq!(
            req.channel,
            Channel::ohlcv(MarketId::new("ETH/USDC"), 1, TimeUnit::Hour)
        );
        assert_eq!((req.from, req.to), (Some(10), Some(20)));
    }

    #[test]
    fn test_parse_trades_unsubscribe() {
        let req = parse_request(
            r#"{"channel":"trades","event":{"type":"UNSUBSCRIBE","payload":{"instrumentKey":"BTC/USDT"}}}"#,
        )
        .unwrap();
        assert_eq!(req.kind, RequestType::Unsubscribe);
        assert_eq!(req.channel.kind(), ChannelKind::Trades);
    }

    #[test]
    fn test_parse_rejects_unknown_resolution() {
        let err = parse_request(
            r#"{"channel":"ohlcv","event":{"type":"SUBSCRIBE","payload":
                {"instrumentKey":"BTC/USDT","duration":7,"units":"min"}}}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SubscribeError::UnknownResolution {
                duration: 7,
                unit: "min".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            parse_request("not json"),
            Err(SubscribeError::Malformed(_))
        ));
        assert!(matches!(
            parse_request(r#"{"channel":"trades","event":{"type":"SUBSCRIBE","payload":{"instrumentKey":"BTCUSDT"}}}"#),
            Err(SubscribeError::InvalidInstrument(_))
        ));
        assert_eq!(
            parse_request(r#"{"channel":"ohlcv","event":{"type":"SUBSCRIBE","payload":{"instrumentKey":"BTC/USDT"}}}"#),
            Err(SubscribeError::MissingField("duration"))
        );
    }
}
