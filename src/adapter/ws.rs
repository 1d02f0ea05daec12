//! WebSocket connector for the live exchange.
//!
//! Each `connect` performs the full session bring-up the reconnect
//! sequence requires: open the socket under a timeout, authenticate when
//! credentials are configured, subscribe every channel, then pump frames
//! (with a ping keepalive) into the manager until the server closes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::adapter::{parse_fixed, ExchangeError, ExchangeOrder, ExchangeOrderStatus, StreamEvent};
use crate::stream::manager::{InboundFrame, StreamConnector};
use crate::types::{MarketKind, OrderSide, OrderType, Ticker};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct WsAuth {
    pub api_key: String,
    /// Base64-encoded signing secret.
    pub api_secret: String,
}

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub symbols: Vec<String>,
    pub auth: Option<WsAuth>,
    pub price_decimals: u32,
    pub base_decimals: u32,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
}

pub struct WsConnector {
    config: WsConfig,
}

impl WsConnector {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    fn auth_payload(auth: &WsAuth) -> Result<Value, ExchangeError> {
        use base64::Engine;
        let timestamp = Utc::now().timestamp_millis();
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&auth.api_secret)
            .map_err(|e| ExchangeError::Auth(format!("bad api secret encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| ExchangeError::Auth(format!("bad api secret length: {e}")))?;
        mac.update(format!("{timestamp}auth").as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(json!({
            "op": "auth",
            "apiKey": auth.api_key,
            "timestamp": timestamp,
            "signature": signature,
        }))
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<mpsc::Receiver<InboundFrame>, ExchangeError> {
        let connect = tokio::time::timeout(self.config.connect_timeout, connect_async(&self.config.url));
        let (ws, response) = match connect.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => return Err(ExchangeError::Network(format!("ws connect: {err}"))),
            Err(_) => return Err(ExchangeError::Timeout),
        };
        info!(url = %self.config.url, status = ?response.status(), "ws connected");
        let (mut write, mut read) = ws.split();

        // Authenticate, then subscribe every channel. A fresh subscription
        // on every connect is what makes reconnects self-healing.
        if let Some(auth) = &self.config.auth {
            let payload = Self::auth_payload(auth)?;
            write
                .send(Message::Text(payload.to_string()))
                .await
                .map_err(|e| ExchangeError::Network(format!("ws auth send: {e}")))?;
        }
        let subscribe = json!({
            "op": "subscribe",
            "channels": ["ticker", "mark", "orders"],
            "symbols": self.config.symbols,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| ExchangeError::Network(format!("ws subscribe send: {e}")))?;

        let (tx, rx) = mpsc::channel(1024);
        let price_decimals = self.config.price_decimals;
        let base_decimals = self.config.base_decimals;
        let ping_interval = self.config.ping_interval;

        // Keepalive writer.
        let ping_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            loop {
                ticker.tick().await;
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });

        // Reader: decode frames until the server closes.
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let value: Value = match serde_json::from_str(&text) {
                            Ok(value) => value,
                            Err(err) => {
                                debug!(error = %err, "undecodable ws frame dropped");
                                continue;
                            }
                        };
                        // Servers batch events into arrays.
                        let values = if value.is_array() {
                            value.as_array().cloned().unwrap_or_default()
                        } else {
                            vec![value]
                        };
                        for value in &values {
                            if let Some(event) = decode_event(value, price_decimals, base_decimals)
                            {
                                if tx.send(InboundFrame::Event(event)).await.is_err() {
                                    ping_task.abort();
                                    return;
                                }
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1006, String::new()));
                        warn!(code, %reason, "ws closed by server");
                        let _ = tx.send(InboundFrame::Closed { code, reason }).await;
                        break;
                    }
                    Err(err) => {
                        warn!(error = %err, "ws read error");
                        let _ = tx
                            .send(InboundFrame::Closed { code: 1006, reason: err.to_string() })
                            .await;
                        break;
                    }
                    _ => {}
                }
            }
            ping_task.abort();
        });

        Ok(rx)
    }
}

// ─────────────────────────────────────────────────────────
// Frame decoding
// ─────────────────────────────────────────────────────────

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn fixed_field(value: &Value, field: &str, decimals: u32) -> Option<i128> {
    match value.get(field)? {
        Value::String(s) => parse_fixed(s, decimals),
        Value::Number(n) => {
            // Integer-encoded values only; float money is refused.
            n.as_i64().map(|v| v as i128 * 10_i128.pow(decimals))
        }
        _ => None,
    }
}

fn timestamp_field(value: &Value, field: &str) -> chrono::DateTime<Utc> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Decode one venue frame into a typed event. Unknown channels drop.
pub fn decode_event(value: &Value, price_decimals: u32, base_decimals: u32) -> Option<StreamEvent> {
    match str_field(value, "channel")? {
        "ticker" => {
            let data = value.get("data")?;
            Some(StreamEvent::Ticker(Ticker {
                symbol: str_field(data, "symbol")?.to_string(),
                bid_quote: fixed_field(data, "bid", price_decimals)?,
                ask_quote: fixed_field(data, "ask", price_decimals)?,
                last_quote: fixed_field(data, "last", price_decimals)?,
                volume_base: fixed_field(data, "volume", base_decimals).unwrap_or(0),
                timestamp: timestamp_field(data, "ts"),
            }))
        }
        "mark" => {
            let data = value.get("data")?;
            Some(StreamEvent::MarkPrice {
                symbol: str_field(data, "symbol")?.to_string(),
                mark_price_quote: fixed_field(data, "price", price_decimals)?,
                timestamp: timestamp_field(data, "ts"),
            })
        }
        "orders" => {
            let data = value.get("data")?;
            let status = match str_field(data, "status")? {
                "NEW" => ExchangeOrderStatus::New,
                "PARTIALLY_FILLED" => ExchangeOrderStatus::PartiallyFilled,
                "FILLED" => ExchangeOrderStatus::Filled,
                "CANCELED" => ExchangeOrderStatus::Canceled,
                "REJECTED" => ExchangeOrderStatus::Rejected,
                other => {
                    debug!(status = other, "unknown order status dropped");
                    return None;
                }
            };
            Some(StreamEvent::OrderUpdate(ExchangeOrder {
                exchange_order_id: str_field(data, "orderId")?.to_string(),
                symbol: str_field(data, "symbol")?.to_string(),
                market: match str_field(data, "market") {
                    Some("spot") => MarketKind::Spot,
                    _ => MarketKind::Perp,
                },
                side: match str_field(data, "side")? {
                    "BUY" => OrderSide::Buy,
                    _ => OrderSide::Sell,
                },
                order_type: match str_field(data, "type") {
                    Some("LIMIT") => OrderType::Limit,
                    _ => OrderType::Market,
                },
                status,
                quantity_base: fixed_field(data, "qty", base_decimals)?,
                filled_quantity_base: fixed_field(data, "filledQty", base_decimals).unwrap_or(0),
                avg_fill_price_quote: fixed_field(data, "avgPrice", price_decimals),
                timestamp: timestamp_field(data, "ts"),
            }))
        }
        other => {
            debug!(channel = other, "unknown channel dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_ticker_frame() {
        let frame = json!({
            "channel": "ticker",
            "data": {
                "symbol": "BTCUSDT",
                "bid": "49995.00",
                "ask": "50005.00",
                "last": "50000.00",
                "volume": "12.5",
                "ts": 1_700_000_000_000_i64,
            }
        });
        match decode_event(&frame, 6, 8).unwrap() {
            StreamEvent::Ticker(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert_eq!(t.bid_quote, 49_995_000_000);
                assert_eq!(t.ask_quote, 50_005_000_000);
                assert_eq!(t.volume_base, 1_250_000_000);
                assert_eq!(t.timestamp.timestamp_millis(), 1_700_000_000_000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_decode_order_update() {
        let frame = json!({
            "channel": "orders",
            "data": {
                "orderId": "X42",
                "symbol": "BTCUSDT",
                "market": "spot",
                "side": "BUY",
                "type": "MARKET",
                "status": "PARTIALLY_FILLED",
                "qty": "1.0",
                "filledQty": "0.4",
                "avgPrice": "50001.25",
                "ts": 1_700_000_000_500_i64,
            }
        });
        match decode_event(&frame, 6, 8).unwrap() {
            StreamEvent::OrderUpdate(o) => {
                assert_eq!(o.exchange_order_id, "X42");
                assert_eq!(o.market, MarketKind::Spot);
                assert_eq!(o.status, ExchangeOrderStatus::PartiallyFilled);
                assert_eq!(o.quantity_base, 100_000_000);
                assert_eq!(o.filled_quantity_base, 40_000_000);
                assert_eq!(o.avg_fill_price_quote, Some(50_001_250_000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_channel_dropped() {
        let frame = json!({ "channel": "liquidations", "data": {} });
        assert!(decode_event(&frame, 6, 8).is_none());
    }

    #[test]
    fn test_dedup_keys_stable_across_decode() {
        let frame = json!({
            "channel": "mark",
            "data": { "symbol": "BTCUSDT", "price": "50000", "ts": 1_700_000_000_000_i64 }
        });
        let a = decode_event(&frame, 6, 8).unwrap().dedup_key();
        let b = decode_event(&frame, 6, 8).unwrap().dedup_key();
        assert_eq!(a, b);
    }
}
