//! Single WebSocket connection to the exchange combined-stream endpoint.
//!
//! The feed owns its socket exclusively. Decode work runs on the reader
//! task; everything downstream goes through the throttled broadcaster,
//! whose emission callbacks never suspend. Transient socket errors
//! reconnect with capped exponential backoff; decode errors drop the frame
//! and keep the connection.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::{decode_stream_frame, DecodedFrame, UpstreamEvent};
use crate::throttle::ThrottledBroadcaster;

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Backoff before reconnect attempt number `attempts` (0-based).
fn reconnect_delay(attempts: u32) -> Duration {
    let factor = 1u32 << attempts.min(5);
    (RECONNECT_BASE * factor).min(RECONNECT_CAP)
}

pub struct UpstreamFeed {
    url: String,
    throttler: Arc<ThrottledBroadcaster>,
    connected: AtomicBool,
    shutdown: AtomicBool,
}

impl UpstreamFeed {
    pub fn new(url: String, throttler: Arc<ThrottledBroadcaster>) -> Arc<Self> {
        Arc::new(Self {
            url,
            throttler,
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Health surface: is the upstream socket currently open?
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Stop the read loop and suppress further reconnects.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        while !self.shutdown.load(Ordering::Relaxed) {
            match connect_async(&self.url).await {
                Ok((socket, _)) => {
                    info!(url = %self.url, "📡 upstream feed connected");
                    self.connected.store(true, Ordering::Release);
                    attempts = 0;

                    self.read_until_closed(socket).await;
                    self.connected.store(false, Ordering::Release);
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    warn!("upstream feed disconnected");
                }
                Err(e) => {
                    warn!(error = %e, "upstream feed connect failed");
                }
            }

            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!(
                    attempts,
                    "upstream feed abandoned after repeated failures"
                );
                break;
            }
            let delay = reconnect_delay(attempts);
            attempts += 1;
            debug!(attempts, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::time::sleep(delay).await;
        }
        self.connected.store(false, Ordering::Release);
    }

    async fn read_until_closed(
        &self,
        socket: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut write, mut read) = socket.split();

        while let Some(message) = read.next().await {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            match message {
                Ok(Message::Text(text)) => self.handle_frame(&text),
                Ok(Message::Ping(payload)) => {
                    // Upstream requires a pong or it drops the connection.
                    if write.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "upstream read error");
                    break;
                }
            }
        }
    }

    /// Decode one combined-stream frame and fan it into the throttled
    /// channels. Decode failures drop the frame only.
    pub fn handle_frame(&self, text: &str) {
        let decoded = match decode_stream_frame(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(error = %e, "dropping undecodable upstream frame");
                return;
            }
        };

        let (event, raw) = match decoded {
            DecodedFrame::Event(event, raw) => (event, raw),
            DecodedFrame::Ignored => return,
            DecodedFrame::UnknownVariant(variant) => {
                debug!(variant, "dropping unknown upstream event variant");
                return;
            }
        };

        if let UpstreamEvent::Kline(kline_event) = &event {
            let row = kline_event.to_row();
            // The candle goes out before the price tick derived from it.
            self.throttler.offer_kline(row.clone());
            self.throttler.offer_kline_persist(row);
        }

        let price_event = event.to_price_event(raw);
        self.throttler.offer_price(price_event.clone());
        self.throttler.offer_price_persist(price_event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Interval, Kline, PriceEvent};
    use crate::throttle::EmitFn;
    use parking_lot::Mutex;

    fn recording_broadcaster() -> (Arc<ThrottledBroadcaster>, Arc<Mutex<Vec<String>>>) {
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let price_calls = calls.clone();
        let on_price: EmitFn<String, PriceEvent> = Arc::new(move |_, e| {
            price_calls.lock().push(format!("price:{}:{}", e.symbol, e.price));
        });
        let kline_calls = calls.clone();
        let on_kline: EmitFn<(String, Interval), Kline> = Arc::new(move |_, k| {
            kline_calls.lock().push(format!("kline:{}:{}", k.symbol, k.close));
        });
        let persist_calls = calls.clone();
        let on_persist: EmitFn<String, PriceEvent> = Arc::new(move |_, e| {
            persist_calls.lock().push(format!("persist:{}:{}", e.symbol, e.price));
        });
        let kline_persist_calls = calls.clone();
        let on_kline_persist: EmitFn<(String, Interval), Kline> = Arc::new(move |_, k| {
            kline_persist_calls
                .lock()
                .push(format!("kpersist:{}:{}:{}", k.symbol, k.close, k.is_closed));
        });

        let broadcaster = Arc::new(ThrottledBroadcaster::new(
            on_price,
            on_kline,
            on_persist,
            on_kline_persist,
        ));
        (broadcaster, calls)
    }

    fn feed(throttler: Arc<ThrottledBroadcaster>) -> Arc<UpstreamFeed> {
        UpstreamFeed::new("wss://example.invalid/stream".into(), throttler)
    }

    #[tokio::test(start_paused = true)]
    async fn mini_ticker_frame_fans_out() {
        let (throttler, calls) = recording_broadcaster();
        let feed = feed(throttler);

        feed.handle_frame(
            r#"{"stream":"btcusdt@miniTicker","data":{"e":"24hrMiniTicker","E":1700000000000,"s":"BTCUSDT","c":"70000.00"}}"#,
        );

        let calls = calls.lock();
        assert!(calls.contains(&"price:BTCUSDT:70000.00".to_string()));
        assert!(calls.contains(&"persist:BTCUSDT:70000.00".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn kline_frame_emits_candle_before_price() {
        let (throttler, calls) = recording_broadcaster();
        let feed = feed(throttler);

        feed.handle_frame(
            r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1700000040123,"s":"BTCUSDT","k":{"t":1700000040000,"T":1700000099999,"s":"BTCUSDT","i":"1m","o":"1","c":"2","h":"3","l":"0.5","v":"10","n":4,"x":false,"q":"20","V":"5","Q":"10"}}}"#,
        );

        let calls = calls.lock();
        let kline_pos = calls.iter().position(|c| c.starts_with("kline:")).unwrap();
        let price_pos = calls.iter().position(|c| c.starts_with("price:")).unwrap();
        assert!(kline_pos < price_pos, "klineUpdate precedes derived priceUpdate");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_kline_persists_immediately() {
        let (throttler, calls) = recording_broadcaster();
        let feed = feed(throttler);

        // Open candle occupies the persistence window...
        feed.handle_frame(
            r#"{"stream":"s","data":{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":0,"T":59999,"s":"BTCUSDT","i":"1m","o":"1","c":"42","h":"3","l":"0.5","v":"10","n":4,"x":false,"q":"20","V":"5","Q":"10"}}}"#,
        );
        // ...and the closed revision still lands without waiting out 5s.
        feed.handle_frame(
            r#"{"stream":"s","data":{"e":"kline","E":2,"s":"BTCUSDT","k":{"t":0,"T":59999,"s":"BTCUSDT","i":"1m","o":"1","c":"43","h":"3","l":"0.5","v":"10","n":5,"x":true,"q":"20","V":"5","Q":"10"}}}"#,
        );

        let calls = calls.lock();
        assert!(calls.contains(&"kpersist:BTCUSDT:42:false".to_string()));
        assert!(calls.contains(&"kpersist:BTCUSDT:43:true".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn control_and_unknown_frames_are_dropped() {
        let (throttler, calls) = recording_broadcaster();
        let feed = feed(throttler);

        feed.handle_frame(r#"{"result":null,"id":1}"#);
        feed.handle_frame(r#"{"stream":"x","data":{"e":"depthUpdate","s":"BTCUSDT"}}"#);
        feed.handle_frame("{broken");
        // Recognized variant, malformed body: dropped, not fatal.
        feed.handle_frame(r#"{"stream":"x","data":{"e":"trade","E":"oops"}}"#);

        assert!(calls.lock().is_empty());
    }

    #[test]
    fn reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(9), Duration::from_secs(30));
    }
}
