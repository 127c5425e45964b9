//! Per-key rate-limited emission with last-value coalescing.
//!
//! Four channels sit between the upstream feed and the rest of the system,
//! each with its own minimum inter-emission gap:
//!
//! | channel            | key                | min interval |
//! |--------------------|--------------------|--------------|
//! | price broadcast    | symbol             | 200 ms       |
//! | kline broadcast    | (symbol, interval) | 500 ms       |
//! | price persistence  | symbol             | 1000 ms      |
//! | kline persistence  | (symbol, interval) | 5000 ms (*)  |
//!
//! (*) closed candles bypass the throttle and are handed on first sight.
//!
//! The coalescing invariant: emitted values are a subsequence of received
//! values in arrival order, inter-emission gaps are >= the channel minimum,
//! and the last value of any burst is always eventually emitted.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{Interval, Kline, PriceEvent};

pub const PRICE_BROADCAST_INTERVAL: Duration = Duration::from_millis(200);
pub const KLINE_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);
pub const PRICE_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);
pub const KLINE_PERSIST_INTERVAL: Duration = Duration::from_millis(5000);

/// Sink invoked on every emission. Must not block or suspend: local fan-out
/// is a volatile write, anything that can suspend gets `tokio::spawn`ed by
/// the callback itself.
pub type EmitFn<K, V> = Arc<dyn Fn(&K, V) + Send + Sync>;

struct Slot<V> {
    last_emit: Option<Instant>,
    pending: Option<V>,
    timer_armed: bool,
    /// Bumped whenever an armed timer is superseded, so a stale wakeup can
    /// recognize itself and stand down.
    generation: u64,
}

impl<V> Default for Slot<V> {
    fn default() -> Self {
        Self {
            last_emit: None,
            pending: None,
            timer_armed: false,
            generation: 0,
        }
    }
}

/// One throttled channel. Decisions run synchronously under the per-key slot
/// lock; the only async piece is the one-shot timer that flushes a coalesced
/// tail.
pub struct Throttle<K, V> {
    min_interval: Duration,
    slots: RwLock<HashMap<K, Arc<Mutex<Slot<V>>>>>,
    emit: EmitFn<K, V>,
}

impl<K, V> Throttle<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(min_interval: Duration, emit: EmitFn<K, V>) -> Self {
        Self {
            min_interval,
            slots: RwLock::new(HashMap::new()),
            emit,
        }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<Slot<V>>> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Offer a value for `key`: emit now if the channel is idle, otherwise
    /// coalesce into the pending slot for the armed timer to pick up.
    pub fn offer(&self, key: K, value: V) {
        let slot = self.slot(&key);
        let mut state = slot.lock();
        let now = Instant::now();

        // An armed timer owns the channel until it fires. It may already be
        // past due without having run yet (separate task, possibly another
        // worker thread), so elapsed time alone must not send us down the
        // immediate path: that would overwrite the pending tail unemitted.
        if state.timer_armed {
            state.pending = Some(value);
            return;
        }

        let elapsed = state.last_emit.map(|last| now.duration_since(last));
        match elapsed {
            Some(elapsed) if elapsed < self.min_interval => {
                state.pending = Some(value);
                state.timer_armed = true;
                state.generation += 1;
                self.arm_timer(
                    key,
                    slot.clone(),
                    self.min_interval - elapsed,
                    state.generation,
                );
            }
            _ => {
                // Idle long enough (or first event): emit immediately. No
                // timer is armed, so there is no pending value to lose.
                state.last_emit = Some(now);
                (self.emit)(&key, value);
            }
        }
    }

    fn arm_timer(&self, key: K, slot: Arc<Mutex<Slot<V>>>, delay: Duration, generation: u64) {
        let emit = self.emit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = slot.lock();
            if state.generation != generation || !state.timer_armed {
                return;
            }
            state.timer_armed = false;
            if let Some(value) = state.pending.take() {
                state.last_emit = Some(Instant::now());
                (emit)(&key, value);
            }
        });
    }

    /// Emit every pending tail immediately, disarming timers. Used at
    /// shutdown so coalesced values are not lost.
    pub fn flush(&self) {
        let slots: Vec<(K, Arc<Mutex<Slot<V>>>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        for (key, slot) in slots {
            let mut state = slot.lock();
            if !state.timer_armed {
                continue;
            }
            state.timer_armed = false;
            state.generation += 1;
            if let Some(value) = state.pending.take() {
                state.last_emit = Some(Instant::now());
                (self.emit)(&key, value);
            }
        }
    }
}

type SymbolKey = String;
type KlineKey = (String, Interval);

/// The four throttled channels between the feed and everything downstream.
///
/// Callbacks are wired once at composition time; each is invoked under the
/// per-key slot lock and must hand any suspendable work to `tokio::spawn`.
pub struct ThrottledBroadcaster {
    price_broadcast: Throttle<SymbolKey, PriceEvent>,
    kline_broadcast: Throttle<KlineKey, Kline>,
    price_persist: Throttle<SymbolKey, PriceEvent>,
    kline_persist: Throttle<KlineKey, Kline>,
    persist_kline_now: EmitFn<KlineKey, Kline>,
}

impl ThrottledBroadcaster {
    pub fn new(
        on_price_broadcast: EmitFn<SymbolKey, PriceEvent>,
        on_kline_broadcast: EmitFn<KlineKey, Kline>,
        on_price_persist: EmitFn<SymbolKey, PriceEvent>,
        on_kline_persist: EmitFn<KlineKey, Kline>,
    ) -> Self {
        Self {
            price_broadcast: Throttle::new(PRICE_BROADCAST_INTERVAL, on_price_broadcast),
            kline_broadcast: Throttle::new(KLINE_BROADCAST_INTERVAL, on_kline_broadcast),
            price_persist: Throttle::new(PRICE_PERSIST_INTERVAL, on_price_persist),
            kline_persist: Throttle::new(KLINE_PERSIST_INTERVAL, on_kline_persist.clone()),
            persist_kline_now: on_kline_persist,
        }
    }

    /// Price fan-out (local rooms + broker publish), 200 ms per symbol.
    pub fn offer_price(&self, event: PriceEvent) {
        self.price_broadcast.offer(event.symbol.clone(), event);
    }

    /// Kline fan-out, 500 ms per (symbol, interval).
    pub fn offer_kline(&self, row: Kline) {
        self.kline_broadcast
            .offer((row.symbol.clone(), row.interval), row);
    }

    /// Persistence enqueue, 1000 ms per symbol.
    pub fn offer_price_persist(&self, event: PriceEvent) {
        self.price_persist.offer(event.symbol.clone(), event);
    }

    /// Kline persistence, 5000 ms per (symbol, interval), except closed
    /// candles, which skip the throttle and persist on first observation.
    pub fn offer_kline_persist(&self, row: Kline) {
        let key = (row.symbol.clone(), row.interval);
        if row.is_closed {
            (self.persist_kline_now)(&key, row);
        } else {
            self.kline_persist.offer(key, row);
        }
    }

    /// Emit all coalesced tails across every channel (shutdown path).
    pub fn flush(&self) {
        self.price_broadcast.flush();
        self.kline_broadcast.flush();
        self.price_persist.flush();
        self.kline_persist.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PriceSource;
    use std::sync::Mutex as StdMutex;
    use tokio::time::advance;

    fn collector<K: Clone, V: Clone + Send + 'static>(
    ) -> (EmitFn<K, V>, Arc<StdMutex<Vec<(Instant, V)>>>)
    where
        K: Send + Sync + 'static,
    {
        let seen: Arc<StdMutex<Vec<(Instant, V)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let emit: EmitFn<K, V> = Arc::new(move |_k, v| {
            sink.lock().unwrap().push((Instant::now(), v));
        });
        (emit, seen)
    }

    fn price(symbol: &str, price: &str, ts: i64) -> PriceEvent {
        PriceEvent {
            symbol: symbol.into(),
            price: price.into(),
            ts,
            source: PriceSource::MiniTicker,
            raw: serde_json::Value::Null,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_event_emits_immediately() {
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("BTCUSDT".to_string(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_leading_edge_plus_tail() {
        // Scenario: 50 events over 100 ms on one key at a 200 ms ceiling.
        // Expect the first event immediately and one trailing emission
        // carrying the last value.
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        for i in 1..=50u32 {
            throttle.offer("BTCUSDT".to_string(), i);
            advance(Duration::from_millis(2)).await;
        }
        // Let the armed timer fire.
        advance(Duration::from_millis(250)).await;

        let emitted = seen.lock().unwrap();
        assert_eq!(emitted.len(), 2, "leading edge + one coalesced tail");
        assert_eq!(emitted[0].1, 1);
        assert_eq!(emitted[1].1, 50, "tail carries the last value of the burst");
    }

    #[tokio::test(start_paused = true)]
    async fn emission_gaps_respect_min_interval() {
        let (emit, seen) = collector::<String, u32>();
        let min = Duration::from_millis(200);
        let throttle = Arc::new(Throttle::new(min, emit));

        // Irregular arrivals for a while.
        for i in 0..100u32 {
            throttle.offer("K".to_string(), i);
            advance(Duration::from_millis(if i % 3 == 0 { 30 } else { 70 })).await;
        }
        advance(Duration::from_millis(300)).await;

        let emitted = seen.lock().unwrap();
        assert!(emitted.len() >= 2);
        for pair in emitted.windows(2) {
            let gap = pair[1].0.duration_since(pair[0].0);
            assert!(gap >= min, "gap {gap:?} below minimum {min:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_period_flushes_last_value() {
        // No dropped tails: after 2x the interval of silence the last
        // arrival must have been emitted.
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("K".to_string(), 1);
        advance(Duration::from_millis(50)).await;
        throttle.offer("K".to_string(), 2);

        advance(Duration::from_millis(400)).await;
        let emitted = seen.lock().unwrap();
        assert_eq!(emitted.last().unwrap().1, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn armed_window_never_loses_the_tail() {
        // While a timer is armed every offer coalesces, even at the window
        // edge; each window's last value comes out before the next window's
        // leading edge is accepted.
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("K".to_string(), 1);
        advance(Duration::from_millis(50)).await;
        throttle.offer("K".to_string(), 2);
        advance(Duration::from_millis(150)).await;
        throttle.offer("K".to_string(), 3);
        advance(Duration::from_millis(250)).await;

        let emitted: Vec<u32> = seen.lock().unwrap().iter().map(|(_, v)| *v).collect();
        assert_eq!(emitted, vec![1, 2, 3], "no offered tail may be dropped");
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_channel_emits_again_without_timer() {
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("K".to_string(), 1);
        advance(Duration::from_millis(500)).await;
        throttle.offer("K".to_string(), 2);

        let emitted = seen.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].1, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_throttle_independently() {
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("A".to_string(), 1);
        throttle.offer("B".to_string(), 2);
        // Both are leading edges on their own keys.
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_emits_pending_tail() {
        let (emit, seen) = collector::<String, u32>();
        let throttle = Arc::new(Throttle::new(Duration::from_millis(200), emit));

        throttle.offer("K".to_string(), 1);
        throttle.offer("K".to_string(), 2);
        assert_eq!(seen.lock().unwrap().len(), 1);

        throttle.flush();
        let emitted = seen.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[1].1, 2);

        // The disarmed timer must not double-emit later.
        drop(emitted);
        advance(Duration::from_millis(300)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_kline_bypasses_persist_throttle() {
        let (price_emit, _) = collector::<String, PriceEvent>();
        let (kline_emit, _) = collector::<(String, Interval), Kline>();
        let (persist_emit, _) = collector::<String, PriceEvent>();
        let (kline_persist_emit, persisted) = collector::<(String, Interval), Kline>();

        let broadcaster = ThrottledBroadcaster::new(
            price_emit,
            kline_emit,
            persist_emit,
            kline_persist_emit,
        );

        let mut row = Kline {
            symbol: "BTCUSDT".into(),
            interval: Interval::M1,
            open_time: 0,
            close_time: 59_999,
            open: "1".into(),
            high: "1".into(),
            low: "1".into(),
            close: "1".into(),
            volume: "0".into(),
            quote_volume: "0".into(),
            trades: 0,
            taker_buy_base_volume: "0".into(),
            taker_buy_quote_volume: "0".into(),
            is_closed: false,
        };

        // Open candle takes the leading edge of the 5 s window...
        broadcaster.offer_kline_persist(row.clone());
        // ...a second open update inside the window is coalesced...
        row.close = "2".into();
        broadcaster.offer_kline_persist(row.clone());
        assert_eq!(persisted.lock().unwrap().len(), 1);

        // ...but the closed candle goes straight through.
        row.close = "3".into();
        row.is_closed = true;
        broadcaster.offer_kline_persist(row.clone());
        let rows = persisted.lock().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[1].1.is_closed);
        assert_eq!(rows[1].1.close, "3");
    }

    #[tokio::test(start_paused = true)]
    async fn price_events_keyed_by_symbol() {
        let (price_emit, seen) = collector::<String, PriceEvent>();
        let (kline_emit, _) = collector::<(String, Interval), Kline>();
        let (persist_emit, _) = collector::<String, PriceEvent>();
        let (kline_persist_emit, _) = collector::<(String, Interval), Kline>();

        let broadcaster = ThrottledBroadcaster::new(
            price_emit,
            kline_emit,
            persist_emit,
            kline_persist_emit,
        );

        broadcaster.offer_price(price("BTCUSDT", "1", 1));
        broadcaster.offer_price(price("BTCUSDT", "2", 2));
        broadcaster.offer_price(price("ETHUSDT", "3", 3));

        let emitted = seen.lock().unwrap();
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].1.price, "1");
        assert_eq!(emitted[1].1.symbol, "ETHUSDT");
    }
}
