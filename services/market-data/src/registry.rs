//! Subscription registry
//!
//! Two indexes kept in step under one mutex:
//! - channel id → set of clients
//! - client → list of channel ids it joined
//!
//! Disconnect cleanup walks only the client's own list. Uses BTreeMap and
//! BTreeSet for deterministic delivery order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channels::SubscribeError;
use crate::metrics::ServiceMetrics;
use crate::outbound::{ClientHandle, ClientId, DeliveryError, OutboundConfig, OutboundMessage};

#[derive(Default)]
struct RegistryState {
    clients: BTreeMap<ClientId, ClientHandle>,
    channels: BTreeMap<String, BTreeSet<ClientId>>,
    by_client: BTreeMap<ClientId, Vec<String>>,
    next_id: ClientId,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    config: OutboundConfig,
    metrics: Arc<ServiceMetrics>,
}

impl SubscriptionRegistry {
    pub fn new(config: OutboundConfig, metrics: Arc<ServiceMetrics>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: 1,
                ..RegistryState::default()
            }),
            config,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client, returning its id and the receiving end of its
    /// outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<OutboundMessage>) {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let (handle, rx) = ClientHandle::channel(id, self.config.queue_capacity);
        state.clients.insert(id, handle);
        state.by_client.insert(id, Vec::new());
        self.metrics.set_connected_clients(state.clients.len() as u64);
        debug!(client = id, "Client registered");
        (id, rx)
    }

    /// Add `client` to a channel. Subscribing twice is a no-op.
    pub fn subscribe(&self, channel_id: &str, client: ClientId) -> Result<(), SubscribeError> {
        let mut state = self.lock();
        let max = self.config.max_subscriptions_per_client;
        let joined = state
            .by_client
            .get_mut(&client)
            .ok_or(SubscribeError::UnknownClient(client))?;

        if joined.iter().any(|c| c == channel_id) {
            return Ok(());
        }
        if joined.len() >= max {
            return Err(SubscribeError::LimitReached(max));
        }
        joined.push(channel_id.to_string());
        state
            .channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(client);
        debug!(client, channel = channel_id, "Subscribed");
        Ok(())
    }

    /// Remove `client` from a channel. Returns whether it was subscribed.
    pub fn unsubscribe(&self, channel_id: &str, client: ClientId) -> bool {
        let mut state = self.lock();
        let removed = Self::leave(&mut state, channel_id, client);
        if let Some(joined) = state.by_client.get_mut(&client) {
            joined.retain(|c| c != channel_id);
        }
        removed
    }

    /// Remove the client from every channel it joined and forget it.
    ///
    /// Returns the channels it left; a second call for the same client
    /// returns `None`.
    pub fn unsubscribe_all(&self, client: ClientId) -> Option<Vec<String>> {
        let mut state = self.lock();
        state.clients.remove(&client)?;
        let joined = state.by_client.remove(&client).unwrap_or_default();
        for channel_id in &joined {
            Self::leave(&mut state, channel_id, client);
        }
        self.metrics.set_connected_clients(state.clients.len() as u64);
        info!(client, channels = joined.len(), "Client disconnected");
        Some(joined)
    }

    fn leave(state: &mut RegistryState, channel_id: &str, client: ClientId) -> bool {
        let Some(members) = state.channels.get_mut(channel_id) else {
            return false;
        };
        let removed = members.remove(&client);
        if members.is_empty() {
            state.channels.remove(channel_id);
        }
        removed
    }

    /// Enqueue `payload` for every subscriber of the channel.
    ///
    /// Never waits on a client. A full or closed queue only affects that
    /// client. Returns the number of clients the message was queued for.
    pub fn broadcast(&self, channel_id: &str, payload: Arc<str>) -> usize {
        let state = self.lock();
        let Some(members) = state.channels.get(channel_id) else {
            return 0;
        };

        let mut delivered = 0;
        for id in members {
            let Some(handle) = state.clients.get(id) else {
                continue;
            };
            match handle.try_send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::QueueFull) => {
                    warn!(client = id, channel = channel_id, "Outbound queue full, dropping message");
                    self.metrics.record_backpressure_drop();
                }
                Err(e) => {
                    debug!(client = id, channel = channel_id, error = %e, "Skipping closed client");
                }
            }
        }
        self.metrics.record_broadcast(delivered as u64);
        delivered
    }

    /// Enqueue a message for a single client.
    pub fn send_to(&self, client: ClientId, payload: Arc<str>) -> Result<(), DeliveryError> {
        let state = self.lock();
        let handle = state.clients.get(&client).ok_or(DeliveryError::Closed)?;
        let result = handle.try_send(payload);
        if result == Err(DeliveryError::QueueFull) {
            self.metrics.record_backpressure_drop();
        }
        result
    }

    /// Clients subscribed to a channel, ascending.
    pub fn subscribers(&self, channel_id: &str) -> Vec<ClientId> {
        self.lock()
            .channels
            .get(channel_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Channels a client joined, in subscription order.
    pub fn channels_of(&self, client: ClientId) -> Vec<String> {
        self.lock()
            .by_client
            .get(&client)
            .cloned()
            .unwrap_or_default()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }
}
