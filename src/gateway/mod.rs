//! Room-based fan-out to downstream WebSocket subscribers.
//!
//! Delivery is volatile: each client has a small bounded outbound channel and
//! frames are dropped for clients that cannot keep up. Price ticks are
//! time-valued; a stale tick is worth nothing, so nothing is ever buffered
//! beyond the channel slack.

pub mod ws;

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::models::{normalize_symbol, Kline, PriceUpdate};

/// Outbound channel slack per client. Beyond this, frames are dropped.
const CLIENT_BUFFER: usize = 64;

pub type ClientId = u64;

/// The seam between the upstream feed and the concrete gateway: the feed
/// (and the broker subscriber) only ever needs these two fire-and-forget
/// calls. Implementations must not block.
pub trait FanOut: Send + Sync {
    fn broadcast_price(&self, symbol: &str, update: &PriceUpdate);
    fn broadcast_kline(&self, symbol: &str, row: &Kline);
}

#[derive(Default)]
struct Inner {
    /// room (symbol) -> member clients
    rooms: HashMap<String, HashMap<ClientId, mpsc::Sender<String>>>,
    /// client -> rooms it is in, for atomic cleanup on disconnect
    memberships: HashMap<ClientId, HashSet<String>>,
    /// every connected client, room member or not
    clients: HashMap<ClientId, mpsc::Sender<String>>,
}

/// Concrete gateway: owns room membership and the per-client senders.
pub struct WsGateway {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl WsGateway {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a freshly accepted connection; the returned receiver feeds
    /// the connection's write pump.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut inner = self.inner.write();
        inner.clients.insert(id, tx);
        inner.memberships.insert(id, HashSet::new());
        (id, rx)
    }

    /// Add the client to the symbol's room, creating it on first subscriber.
    pub fn subscribe(&self, client: ClientId, symbol: &str) {
        let room = normalize_symbol(symbol);
        let mut inner = self.inner.write();
        let Some(tx) = inner.clients.get(&client).cloned() else {
            return;
        };
        inner.rooms.entry(room.clone()).or_default().insert(client, tx);
        if let Some(joined) = inner.memberships.get_mut(&client) {
            joined.insert(room);
        }
    }

    pub fn unsubscribe(&self, client: ClientId, symbol: &str) {
        let room = normalize_symbol(symbol);
        let mut inner = self.inner.write();
        if let Some(members) = inner.rooms.get_mut(&room) {
            members.remove(&client);
            if members.is_empty() {
                inner.rooms.remove(&room);
            }
        }
        if let Some(joined) = inner.memberships.get_mut(&client) {
            joined.remove(&room);
        }
    }

    /// Drop the client from every room and forget its sender. Called on
    /// disconnect; no explicit unsubscribe is required of clients.
    pub fn remove_client(&self, client: ClientId) {
        let mut inner = self.inner.write();
        if let Some(joined) = inner.memberships.remove(&client) {
            for room in joined {
                if let Some(members) = inner.rooms.get_mut(&room) {
                    members.remove(&client);
                    if members.is_empty() {
                        inner.rooms.remove(&room);
                    }
                }
            }
        }
        inner.clients.remove(&client);
    }

    /// Send one frame to one client, volatile.
    pub fn send_to(&self, client: ClientId, frame: String) {
        let tx = self.inner.read().clients.get(&client).cloned();
        if let Some(tx) = tx {
            if tx.try_send(frame).is_err() {
                trace!(client, "dropped direct frame (client not writable)");
            }
        }
    }

    /// Fan a named event out to every member of `room`. Serialization
    /// happens once; unwritable members just miss this frame.
    fn emit_to_room<T: Serialize>(&self, room: &str, event: &str, payload: &T) {
        let frame = match serde_json::to_string(&ws::ServerFrame { event, data: payload }) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, event, "failed to serialize outbound frame");
                return;
            }
        };

        let members: Vec<mpsc::Sender<String>> = {
            let inner = self.inner.read();
            match inner.rooms.get(room) {
                Some(members) => members.values().cloned().collect(),
                None => return,
            }
        };

        let mut dropped = 0usize;
        for tx in &members {
            if tx.try_send(frame.clone()).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            trace!(room, dropped, "volatile frames dropped");
        }
    }

    pub fn room_size(&self, symbol: &str) -> usize {
        self.inner
            .read()
            .rooms
            .get(&normalize_symbol(symbol))
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn is_member(&self, client: ClientId, symbol: &str) -> bool {
        self.inner
            .read()
            .rooms
            .get(&normalize_symbol(symbol))
            .map(|members| members.contains_key(&client))
            .unwrap_or(false)
    }
}

impl Default for WsGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FanOut for WsGateway {
    fn broadcast_price(&self, symbol: &str, update: &PriceUpdate) {
        self.emit_to_room(symbol, "priceUpdate", update);
    }

    fn broadcast_kline(&self, symbol: &str, row: &Kline) {
        self.emit_to_room(symbol, "klineUpdate", row);
    }
}
