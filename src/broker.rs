//! Pub/sub broker connection for cross-replica fan-out.
//!
//! Two logical connections: a publisher (connection-managed, reconnects on
//! its own) and a pattern subscriber on `prices:*`. Published payloads are
//! the JSON `PriceEvent` plus an `origin` replica id; the subscriber skips
//! its own messages so locally-delivered frames are not duplicated, and
//! replays everything else into the local gateway exactly as if the local
//! feed had emitted it.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gateway::FanOut;
use crate::models::{KlineEvent, PriceEvent, PriceUpdate};

const RECONNECT_STEP: Duration = Duration::from_millis(100);
const RECONNECT_CAP: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize, Deserialize)]
struct BrokerEnvelope {
    origin: String,
    #[serde(flatten)]
    event: PriceEvent,
}

pub struct RedisBroker {
    client: Client,
    publisher: ConnectionManager,
    /// This replica's identity, stamped on every published message.
    origin: String,
    subscriber_connected: AtomicBool,
}

impl RedisBroker {
    pub async fn connect(url: &str, origin: String) -> Result<Arc<Self>> {
        let client = Client::open(url).context("invalid broker URL")?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .context("failed to connect broker publisher")?;
        info!(%origin, "📮 broker publisher connected");

        Ok(Arc::new(Self {
            client,
            publisher,
            origin,
            subscriber_connected: AtomicBool::new(false),
        }))
    }

    pub fn connected(&self) -> bool {
        self.subscriber_connected.load(Ordering::Acquire)
    }

    /// Publish a price event on `prices:<SYMBOL>`, fire-and-forget. Broker
    /// failures are logged and never reach the feed.
    pub fn publish_price(&self, event: &PriceEvent) {
        let channel = format!("prices:{}", event.symbol);
        let payload = match serde_json::to_string(&BrokerEnvelope {
            origin: self.origin.clone(),
            event: event.clone(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "failed to serialize broker payload");
                return;
            }
        };

        let mut conn = self.publisher.clone();
        tokio::spawn(async move {
            let result: redis::RedisResult<i64> = conn.publish(&channel, payload).await;
            if let Err(e) = result {
                debug!(error = %e, channel, "broker publish failed");
            }
        });
    }

    /// Pattern-subscribe `prices:*` and replay remote emissions into the
    /// local gateway. Runs until aborted; reconnects with
    /// `min(retries * 100ms, 3s)`.
    pub fn spawn_subscriber(self: Arc<Self>, gateway: Arc<dyn FanOut>) -> JoinHandle<()> {
        let broker = self;
        tokio::spawn(async move {
            let mut retries: u32 = 0;
            loop {
                match broker.subscribe_once(&gateway).await {
                    Ok(()) => {
                        // Stream ended cleanly (connection dropped).
                        retries = retries.saturating_add(1);
                    }
                    Err(e) => {
                        warn!(error = %e, "broker subscriber error");
                        retries = retries.saturating_add(1);
                    }
                }
                broker.subscriber_connected.store(false, Ordering::Release);

                let delay = (RECONNECT_STEP * retries).min(RECONNECT_CAP);
                tokio::time::sleep(delay).await;
            }
        })
    }

    async fn subscribe_once(&self, gateway: &Arc<dyn FanOut>) -> Result<()> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open broker subscriber connection")?;
        pubsub
            .psubscribe("prices:*")
            .await
            .context("pattern subscribe failed")?;

        self.subscriber_connected.store(true, Ordering::Release);
        info!("📥 broker subscriber listening on prices:*");

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let payload: String = match message.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(error = %e, "undecodable broker message");
                    continue;
                }
            };
            dispatch_broker_message(gateway.as_ref(), &self.origin, &payload);
        }

        Ok(())
    }
}

/// Hand one broker message to the local gateway. Messages from this replica
/// are skipped (the local path already delivered them); kline-sourced events
/// re-derive the `klineUpdate` before the `priceUpdate`.
fn dispatch_broker_message(gateway: &dyn FanOut, own_origin: &str, payload: &str) {
    let envelope: BrokerEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(error = %e, "unparseable broker message");
            return;
        }
    };
    if envelope.origin == own_origin {
        return;
    }

    let event = &envelope.event;
    if event.raw.get("e").and_then(|e| e.as_str()) == Some("kline") {
        match serde_json::from_value::<KlineEvent>(event.raw.clone()) {
            Ok(kline_event) => {
                let row = kline_event.to_row();
                gateway.broadcast_kline(&row.symbol, &row);
            }
            Err(e) => debug!(error = %e, "broker kline payload undecodable"),
        }
    }

    gateway.broadcast_price(&event.symbol, &PriceUpdate::from(event));
}
