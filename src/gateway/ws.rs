//! The `/prices` WebSocket namespace: connection lifecycle and the
//! subscribe/unsubscribe protocol.
//!
//! Envelope is broker-agnostic JSON: `{"event": <name>, "data": <payload>}`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::{ClientId, WsGateway};
use crate::api::AppState;
use crate::models::normalize_symbol;

/// Outbound envelope. `data` is borrowed so room fan-out serializes once.
#[derive(Debug, Serialize)]
pub struct ServerFrame<'a, T> {
    pub event: &'a str,
    pub data: T,
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Ack payload for subscribe/unsubscribe requests.
#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
enum Ack {
    Success { status: &'static str, symbol: String },
    Error { status: &'static str, message: String },
}

impl Ack {
    fn success(symbol: String) -> Self {
        Ack::Success {
            status: "success",
            symbol,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Ack::Error {
            status: "error",
            message: message.into(),
        }
    }
}

pub async fn prices_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.gateway))
}

async fn handle_socket(socket: WebSocket, gateway: Arc<WsGateway>) {
    let (client, mut outbound) = gateway.register();
    info!(client, "price client connected");

    let (mut sink, mut stream) = socket.split();

    // Write pump: drains the volatile channel into the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => handle_client_frame(&gateway, client, &text),
            Message::Close(_) => break,
            // Pings are answered by the websocket layer itself.
            _ => {}
        }
    }

    gateway.remove_client(client);
    writer.abort();
    info!(client, "price client disconnected");
}

fn handle_client_frame(gateway: &WsGateway, client: ClientId, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(client, error = %e, "unparseable client frame");
            return;
        }
    };

    match frame.event.as_str() {
        "subscribe" => {
            let ack = match extract_symbol(frame.data.as_ref()) {
                Ok(symbol) => {
                    gateway.subscribe(client, &symbol);
                    debug!(client, %symbol, "subscribed");
                    Ack::success(symbol)
                }
                Err(message) => Ack::error(message),
            };
            send_ack(gateway, client, "subscribe", &ack);
        }
        "unsubscribe" => {
            let ack = match extract_symbol(frame.data.as_ref()) {
                Ok(symbol) => {
                    gateway.unsubscribe(client, &symbol);
                    debug!(client, %symbol, "unsubscribed");
                    Ack::success(symbol)
                }
                Err(message) => Ack::error(message),
            };
            send_ack(gateway, client, "unsubscribe", &ack);
        }
        other => {
            debug!(client, event = other, "unknown client event");
        }
    }
}

fn send_ack(gateway: &WsGateway, client: ClientId, event: &str, ack: &Ack) {
    if let Ok(frame) = serde_json::to_string(&ServerFrame { event, data: ack }) {
        gateway.send_to(client, frame);
    }
}

/// Pull the symbol out of a subscribe/unsubscribe payload.
///
/// Accepted shapes: `{"symbol": "btcusdt"}`, the same object JSON-encoded as
/// a string, or a bare symbol string. Lookup is case-normalized.
fn extract_symbol(data: Option<&Value>) -> Result<String, &'static str> {
    let data = data.ok_or("symbol is required")?;

    let symbol = match data {
        Value::Object(fields) => fields
            .get("symbol")
            .and_then(|s| s.as_str())
            .map(str::to_string),
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields
                .get("symbol")
                .and_then(|s| s.as_str())
                .map(str::to_string),
            Ok(Value::String(inner)) => Some(inner),
            // Not JSON (or not a shape that carries a symbol): the raw
            // string is the symbol.
            _ => Some(text.clone()),
        },
        _ => None,
    };

    match symbol {
        Some(raw) if !raw.trim().is_empty() => Ok(normalize_symbol(&raw)),
        Some(_) => Err("symbol must not be empty"),
        None => Err("symbol is required"),
    }
}
