//! Core market-data types shared across the streaming pipeline.
//!
//! Monetary and volume fields stay as exchange-reported strings end-to-end;
//! parsing to numeric is the final consumer's job. Timestamps are i64
//! milliseconds.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Normalize a trading-pair identifier at the boundary (e.g. `btcusdt` -> `BTCUSDT`).
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Candlestick interval. The closed set the upstream exchange supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Interval {
    pub const ALL: [Interval; 15] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
        Interval::D3,
        Interval::W1,
        Interval::Mo1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
            Interval::D3 => "3d",
            Interval::W1 => "1w",
            Interval::Mo1 => "1M",
        }
    }

    /// Fixed duration in milliseconds, used by freshness checks.
    /// `1M` is calendar-month on the exchange; a 30-day nominal duration is
    /// close enough for staleness math.
    pub fn duration_ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        match self {
            Interval::M1 => MINUTE,
            Interval::M3 => 3 * MINUTE,
            Interval::M5 => 5 * MINUTE,
            Interval::M15 => 15 * MINUTE,
            Interval::M30 => 30 * MINUTE,
            Interval::H1 => HOUR,
            Interval::H2 => 2 * HOUR,
            Interval::H4 => 4 * HOUR,
            Interval::H6 => 6 * HOUR,
            Interval::H8 => 8 * HOUR,
            Interval::H12 => 12 * HOUR,
            Interval::D1 => DAY,
            Interval::D3 => 3 * DAY,
            Interval::W1 => 7 * DAY,
            Interval::Mo1 => 30 * DAY,
        }
    }
}

impl FromStr for Interval {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which upstream stream variant a price event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    MiniTicker,
    Trade,
    Kline,
}

/// Normalized in-memory price event. `raw` keeps the original upstream
/// payload so the broker subscriber can recover the kline body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEvent {
    pub symbol: String,
    pub price: String,
    pub ts: i64,
    pub source: PriceSource,
    pub raw: Value,
}

/// Persisted OHLCV candle, keyed `(symbol, interval, openTime)`.
/// Field names are camelCase on the wire and in stored documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: i64,
    pub close_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub quote_volume: String,
    pub trades: i64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
    pub is_closed: bool,
}

// ---------------------------------------------------------------------------
// Upstream combined-stream payloads, discriminated by the `e` field.
// ---------------------------------------------------------------------------

/// 24hr mini-ticker event (`"e":"24hrMiniTicker"`). Price is the close `c`.
#[derive(Debug, Clone, Deserialize)]
pub struct MiniTickerEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close: String,
}

/// Raw trade event (`"e":"trade"`). Price is `p`.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
}

/// Kline event (`"e":"kline"`). Price is the candle close `k.c`; the candle
/// body is also an upsert candidate for the history store.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEvent {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlinePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KlinePayload {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "i")]
    pub interval: Interval,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "q")]
    pub quote_volume: String,
    #[serde(rename = "n")]
    pub trades: i64,
    #[serde(rename = "V")]
    pub taker_buy_base_volume: String,
    #[serde(rename = "Q")]
    pub taker_buy_quote_volume: String,
    #[serde(rename = "x")]
    pub is_closed: bool,
}

impl KlineEvent {
    /// Build the persisted row from the stream payload.
    pub fn to_row(&self) -> Kline {
        let k = &self.kline;
        Kline {
            symbol: normalize_symbol(&self.symbol),
            interval: k.interval,
            open_time: k.open_time,
            close_time: k.close_time,
            open: k.open.clone(),
            high: k.high.clone(),
            low: k.low.clone(),
            close: k.close.clone(),
            volume: k.volume.clone(),
            quote_volume: k.quote_volume.clone(),
            trades: k.trades,
            taker_buy_base_volume: k.taker_buy_base_volume.clone(),
            taker_buy_quote_volume: k.taker_buy_quote_volume.clone(),
            is_closed: k.is_closed,
        }
    }
}

/// Decoded upstream event, one of the three recognized variants.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    MiniTicker(MiniTickerEvent),
    Trade(TradeEvent),
    Kline(KlineEvent),
}

/// Outcome of decoding one combined-stream frame. An event carries the raw
/// `data` payload alongside the typed variant so the normalized
/// [`PriceEvent`] can keep the original body.
#[derive(Debug)]
pub enum DecodedFrame {
    Event(UpstreamEvent, Value),
    /// No `data.e` field; subscription acks and similar control traffic.
    Ignored,
    /// A discriminator we do not recognize.
    UnknownVariant(String),
}

/// Decode a combined-stream frame `{"stream": ..., "data": {...}}`.
///
/// Frames without a `data.e` discriminator are ignored; unknown `e` values
/// are surfaced so the caller can log and drop them. A recognized variant
/// that fails to deserialize is a decode error.
pub fn decode_stream_frame(text: &str) -> anyhow::Result<DecodedFrame> {
    let frame: Value = serde_json::from_str(text)?;
    let Some(data) = frame.get("data") else {
        return Ok(DecodedFrame::Ignored);
    };
    let Some(event_type) = data.get("e").and_then(|e| e.as_str()) else {
        return Ok(DecodedFrame::Ignored);
    };

    let event = match event_type {
        "24hrMiniTicker" => {
            UpstreamEvent::MiniTicker(serde_json::from_value(data.clone())?)
        }
        "trade" => UpstreamEvent::Trade(serde_json::from_value(data.clone())?),
        "kline" => UpstreamEvent::Kline(serde_json::from_value(data.clone())?),
        other => return Ok(DecodedFrame::UnknownVariant(other.to_string())),
    };

    Ok(DecodedFrame::Event(event, data.clone()))
}

impl UpstreamEvent {
    /// Normalize to the in-memory price event. `ts` is the exchange event
    /// time `E`; `raw` carries the original `data` payload.
    pub fn to_price_event(&self, raw: Value) -> PriceEvent {
        match self {
            UpstreamEvent::MiniTicker(t) => PriceEvent {
                symbol: normalize_symbol(&t.symbol),
                price: t.close.clone(),
                ts: t.event_time,
                source: PriceSource::MiniTicker,
                raw,
            },
            UpstreamEvent::Trade(t) => PriceEvent {
                symbol: normalize_symbol(&t.symbol),
                price: t.price.clone(),
                ts: t.event_time,
                source: PriceSource::Trade,
                raw,
            },
            UpstreamEvent::Kline(k) => PriceEvent {
                symbol: normalize_symbol(&k.symbol),
                price: k.kline.close.clone(),
                ts: k.event_time,
                source: PriceSource::Kline,
                raw,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream wire messages (the `/prices` namespace).
// ---------------------------------------------------------------------------

/// Short keys on purpose: this frame is the bandwidth hot path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub s: String,
    pub p: String,
    pub t: i64,
}

impl From<&PriceEvent> for PriceUpdate {
    fn from(event: &PriceEvent) -> Self {
        PriceUpdate {
            s: event.symbol.clone(),
            p: event.price.clone(),
            t: event.ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_round_trip() {
        for interval in Interval::ALL {
            assert_eq!(interval.as_str().parse::<Interval>(), Ok(interval));
        }
        assert!("7m".parse::<Interval>().is_err());
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn interval_durations() {
        assert_eq!(Interval::M1.duration_ms(), 60_000);
        assert_eq!(Interval::H1.duration_ms(), 3_600_000);
        assert_eq!(Interval::D1.duration_ms(), 86_400_000);
        assert_eq!(Interval::W1.duration_ms(), 7 * 86_400_000);
        // 1M and 1m are distinct members of the set.
        assert_ne!(
            "1M".parse::<Interval>().unwrap(),
            "1m".parse::<Interval>().unwrap()
        );
    }

    #[test]
    fn decode_mini_ticker() {
        let frame = r#"{"stream":"btcusdt@miniTicker","data":{"e":"24hrMiniTicker","E":1700000000000,"s":"BTCUSDT","c":"70000.00","o":"69000.00","h":"70500.00","l":"68900.00","v":"1234.5","q":"86000000"}}"#;
        let decoded = decode_stream_frame(frame).unwrap();
        let DecodedFrame::Event(event, _) = decoded else {
            panic!("expected event, got {decoded:?}");
        };
        let price = event.to_price_event(Value::Null);
        assert_eq!(price.symbol, "BTCUSDT");
        assert_eq!(price.price, "70000.00");
        assert_eq!(price.ts, 1700000000000);
        assert_eq!(price.source, PriceSource::MiniTicker);
    }

    #[test]
    fn decode_trade() {
        let frame = r#"{"stream":"ethusdt@trade","data":{"e":"trade","E":1700000001000,"s":"ETHUSDT","t":123456,"p":"3500.10","q":"0.5","T":1700000000999,"m":true,"M":true}}"#;
        let DecodedFrame::Event(event, _) = decode_stream_frame(frame).unwrap() else {
            panic!("expected event");
        };
        let price = event.to_price_event(Value::Null);
        assert_eq!(price.symbol, "ETHUSDT");
        assert_eq!(price.price, "3500.10");
        assert_eq!(price.source, PriceSource::Trade);
    }

    #[test]
    fn decode_kline() {
        let frame = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","E":1700000040123,"s":"BTCUSDT","k":{"t":1700000040000,"T":1700000099999,"s":"BTCUSDT","i":"1m","f":100,"L":200,"o":"69990.00","c":"70001.50","h":"70010.00","l":"69980.00","v":"12.34","n":42,"x":false,"q":"863000.00","V":"6.17","Q":"431500.00","B":"0"}}}"#;
        let DecodedFrame::Event(UpstreamEvent::Kline(kline), _) =
            decode_stream_frame(frame).unwrap()
        else {
            panic!("expected kline event");
        };

        let row = kline.to_row();
        assert_eq!(row.symbol, "BTCUSDT");
        assert_eq!(row.interval, Interval::M1);
        assert_eq!(row.open_time, 1700000040000);
        assert_eq!(row.close_time, 1700000099999);
        assert_eq!(row.close, "70001.50");
        assert_eq!(row.trades, 42);
        assert!(!row.is_closed);

        let price = UpstreamEvent::Kline(kline).to_price_event(Value::Null);
        assert_eq!(price.price, "70001.50");
        assert_eq!(price.ts, 1700000040123);
        assert_eq!(price.source, PriceSource::Kline);
    }

    #[test]
    fn frames_without_discriminator_are_ignored() {
        // Subscription ack
        assert!(matches!(
            decode_stream_frame(r#"{"result":null,"id":1}"#).unwrap(),
            DecodedFrame::Ignored
        ));
        // Combined frame whose data has no `e`
        assert!(matches!(
            decode_stream_frame(r#"{"stream":"x","data":{"foo":1}}"#).unwrap(),
            DecodedFrame::Ignored
        ));
    }

    #[test]
    fn unknown_variant_is_surfaced() {
        let frame = r#"{"stream":"btcusdt@depth","data":{"e":"depthUpdate","E":1,"s":"BTCUSDT"}}"#;
        let DecodedFrame::UnknownVariant(variant) = decode_stream_frame(frame).unwrap() else {
            panic!("expected unknown variant");
        };
        assert_eq!(variant, "depthUpdate");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(decode_stream_frame("{not json").is_err());
        // Recognized variant with a broken body is a decode error too.
        let frame = r#"{"stream":"x","data":{"e":"trade","E":"not-a-number"}}"#;
        assert!(decode_stream_frame(frame).is_err());
    }

    #[test]
    fn price_event_broker_round_trip() {
        let event = PriceEvent {
            symbol: "BNBUSDT".into(),
            price: "612.34".into(),
            ts: 1_700_000_000_000,
            source: PriceSource::MiniTicker,
            raw: serde_json::json!({"e":"24hrMiniTicker","s":"BNBUSDT"}),
        };
        let wire = serde_json::to_string(&event).unwrap();
        let back: PriceEvent = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.symbol, event.symbol);
        assert_eq!(back.price, event.price);
        assert_eq!(back.ts, event.ts);
        assert_eq!(back.source, event.source);
    }

    #[test]
    fn kline_serializes_camel_case() {
        let row = Kline {
            symbol: "BTCUSDT".into(),
            interval: Interval::M1,
            open_time: 1,
            close_time: 59_999,
            open: "1".into(),
            high: "2".into(),
            low: "0.5".into(),
            close: "1.5".into(),
            volume: "10".into(),
            quote_volume: "15".into(),
            trades: 3,
            taker_buy_base_volume: "4".into(),
            taker_buy_quote_volume: "6".into(),
            is_closed: true,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["openTime"], 1);
        assert_eq!(json["quoteVolume"], "15");
        assert_eq!(json["takerBuyBaseVolume"], "4");
        assert_eq!(json["isClosed"], true);
        assert_eq!(json["interval"], "1m");
    }
}
