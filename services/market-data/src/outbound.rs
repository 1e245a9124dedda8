//! Per-client outbound delivery
//!
//! Each connected client owns a bounded queue drained by its own writer
//! task. Broadcasters only ever `try_send` into the queue, so a slow or
//! dead client never blocks delivery to anyone else: a full queue drops
//! the message for that client only.
//!
//! Every message is wrapped in the envelope
//! `{"channel": <kind>, "event": {"type": "INIT"|"UPDATE"|"ERROR", "payload": ...}}`
//! and serialized once per broadcast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channels::ChannelKind;

/// Unique client identifier.
pub type ClientId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Init,
    Update,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// Envelope for every message sent to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketMessage {
    pub channel: ChannelKind,
    pub event: WebsocketEvent,
}

impl WebsocketMessage {
    pub fn new(channel: ChannelKind, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            channel,
            event: WebsocketEvent {
                event_type,
                payload,
            },
        }
    }

    /// Serialize the envelope around any payload.
    pub fn encode<T: Serialize>(
        channel: ChannelKind,
        event_type: EventType,
        payload: &T,
    ) -> Result<Arc<str>, DeliveryError> {
        let payload =
            serde_json::to_value(payload).map_err(|e| DeliveryError::Encode(e.to_string()))?;
        let text = serde_json::to_string(&Self::new(channel, event_type, payload))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;
        Ok(Arc::from(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    QueueFull,

    #[error("client connection closed")]
    Closed,

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("write failed: {0}")]
    Write(String),
}

/// A queued message for one client.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Serialized envelope, shared across recipients.
    pub payload: Arc<str>,
    /// Per-client sequence number.
    pub sequence: u64,
}

/// Configuration for per-client delivery.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Maximum queued messages per client.
    pub queue_capacity: usize,
    /// Max subscriptions per client.
    pub max_subscriptions_per_client: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_subscriptions_per_client: 50,
        }
    }
}

/// Sending half of a client's queue.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<OutboundMessage>,
    sequence: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl ClientHandle {
    /// Create a handle and the receiver its writer drains.
    pub fn channel(id: ClientId, capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id,
                tx,
                sequence: Arc::new(AtomicU64::new(0)),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, payload: Arc<str>) -> Result<(), DeliveryError> {
        let message = OutboundMessage {
            payload,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        };
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                DeliveryError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Messages dropped because the queue was full.
    pub fn messages_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Transport half of a client connection.
#[async_trait]
pub trait MessageWriter: Send {
    async fn write(&mut self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Drain `rx` into `writer` until either side closes, then run `on_close`.
pub fn spawn_writer<W, F>(
    client: ClientId,
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut writer: W,
    on_close: F,
) -> JoinHandle<()>
where
    W: MessageWriter + 'static,
    F: FnOnce(ClientId) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = writer.write(&message).await {
                warn!(client, error = %e, "Client write failed, closing");
                break;
            }
        }
        debug!(client, "Writer finished");
        on_close(client);
    })
}
