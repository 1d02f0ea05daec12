//! Signed REST adapter for the live exchange.
//!
//! Thin HTTP layer: assemble the request, sign private calls with
//! HMAC-SHA256 over the timestamped query string, decode JSON into core
//! types, and map HTTP failures onto the error taxonomy (429 honors
//! `Retry-After`). Retries, rate limiting and timeouts live in the request
//! policy, not here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, Response, StatusCode};
use serde_json::{json, Value};
use sha2::Sha256;
use url::Url;

use crate::adapter::ws::{WsAuth, WsConfig, WsConnector};
use crate::adapter::{
    format_fixed, parse_fixed, ExchangeAdapter, ExchangeError, ExchangeOrder, ExchangeOrderStatus,
    OrderRequest, TimeInForce,
};
use crate::stream::manager::StreamConnector;
use crate::types::{
    Amount, Balance, BookLevel, FundingRate, MarketKind, OrderBook, OrderSide, OrderType, Position,
    Side, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub ws_url: String,
    pub api_key: String,
    /// Base64-encoded signing secret.
    pub api_secret: String,
    pub symbols: Vec<String>,
    pub price_decimals: u32,
    pub base_decimals: u32,
}

impl RestConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_url: std::env::var("FA_REST_URL")
                .unwrap_or_else(|_| "https://api.example-exchange.com".into()),
            ws_url: std::env::var("FA_WS_URL")
                .unwrap_or_else(|_| "wss://stream.example-exchange.com/ws".into()),
            api_key: std::env::var("FA_API_KEY")
                .map_err(|_| anyhow::anyhow!("FA_API_KEY not set"))?,
            api_secret: std::env::var("FA_API_SECRET")
                .map_err(|_| anyhow::anyhow!("FA_API_SECRET not set"))?,
            symbols: std::env::var("FA_SYMBOLS")
                .unwrap_or_else(|_| "BTCUSDT".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            price_decimals: 6,
            base_decimals: 8,
        })
    }
}

pub struct RestAdapter {
    http: reqwest::Client,
    config: RestConfig,
    connected: AtomicBool,
    connector: Arc<WsConnector>,
}

impl RestAdapter {
    pub fn new(config: RestConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let connector = Arc::new(WsConnector::new(WsConfig {
            url: config.ws_url.clone(),
            symbols: config.symbols.clone(),
            auth: Some(WsAuth {
                api_key: config.api_key.clone(),
                api_secret: config.api_secret.clone(),
            }),
            price_decimals: config.price_decimals,
            base_decimals: config.base_decimals,
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
        }));
        Ok(Self { http, config, connected: AtomicBool::new(false), connector })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExchangeError> {
        Url::parse(&self.config.base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| ExchangeError::Fatal(format!("bad endpoint {path}: {e}")))
    }

    /// HMAC-SHA256 over `query + timestamp`, hex-encoded.
    fn sign(&self, query: &str, timestamp_ms: i64) -> Result<String, ExchangeError> {
        use base64::Engine;
        let secret = base64::engine::general_purpose::STANDARD
            .decode(&self.config.api_secret)
            .map_err(|e| ExchangeError::Auth(format!("bad api secret encoding: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(&secret)
            .map_err(|e| ExchangeError::Auth(format!("bad api secret length: {e}")))?;
        mac.update(query.as_bytes());
        mac.update(timestamp_ms.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        private: bool,
    ) -> Result<Value, ExchangeError> {
        let mut url = self.endpoint(path)?;
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }

        let mut builder = self.http.request(method, url.clone());
        if private {
            let timestamp_ms = Utc::now().timestamp_millis();
            let signature = self.sign(url.query().unwrap_or(""), timestamp_ms)?;
            builder = builder
                .header("X-API-KEY", &self.config.api_key)
                .header("X-TIMESTAMP", timestamp_ms.to_string())
                .header("X-SIGNATURE", signature);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::Timeout
                } else {
                    ExchangeError::Network(e.to_string())
                }
            })?;
        Self::decode_response(response).await
    }

    async fn decode_response(response: Response) -> Result<Value, ExchangeError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<Value>()
                .await
                .map_err(|e| ExchangeError::Network(format!("bad response body: {e}")));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }
}

/// HTTP status → error taxonomy.
fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ExchangeError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ExchangeError::Throttled { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ExchangeError::Auth(format!("{status}: {body}"))
        }
        status if status.is_server_error() => ExchangeError::Server { status: status.as_u16() },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            // The venue distinguishes parameter errors from account state
            // in the body; insufficient-balance style failures are business.
            if body.contains("insufficient") || body.contains("balance") {
                ExchangeError::Business(body.to_string())
            } else {
                ExchangeError::Validation(body.to_string())
            }
        }
        StatusCode::NOT_FOUND => ExchangeError::Business(format!("not found: {body}")),
        status => ExchangeError::Network(format!("unexpected status {status}: {body}")),
    }
}

// ─────────────────────────────────────────────────────────
// JSON decoding into core types
// ─────────────────────────────────────────────────────────

fn str_field<'a>(value: &'a Value, field: &str) -> Result<&'a str, ExchangeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ExchangeError::Validation(format!("missing field {field}")))
}

fn fixed_field(value: &Value, field: &str, decimals: u32) -> Result<Amount, ExchangeError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| parse_fixed(raw, decimals))
        .ok_or_else(|| ExchangeError::Validation(format!("bad numeric field {field}")))
}

fn opt_fixed_field(value: &Value, field: &str, decimals: u32) -> Option<Amount> {
    value.get(field).and_then(Value::as_str).and_then(|raw| parse_fixed(raw, decimals))
}

fn timestamp_field(value: &Value, field: &str) -> chrono::DateTime<Utc> {
    value
        .get(field)
        .and_then(Value::as_i64)
        .and_then(chrono::DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

fn decode_order(value: &Value, price_decimals: u32, base_decimals: u32) -> Result<ExchangeOrder, ExchangeError> {
    let status = match str_field(value, "status")? {
        "NEW" => ExchangeOrderStatus::New,
        "PARTIALLY_FILLED" => ExchangeOrderStatus::PartiallyFilled,
        "FILLED" => ExchangeOrderStatus::Filled,
        "CANCELED" => ExchangeOrderStatus::Canceled,
        "REJECTED" => ExchangeOrderStatus::Rejected,
        other => {
            return Err(ExchangeError::Validation(format!("unknown order status {other}")));
        }
    };
    Ok(ExchangeOrder {
        exchange_order_id: str_field(value, "orderId")?.to_string(),
        symbol: str_field(value, "symbol")?.to_string(),
        market: match value.get("market").and_then(Value::as_str) {
            Some("spot") => MarketKind::Spot,
            _ => MarketKind::Perp,
        },
        side: match str_field(value, "side")? {
            "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        },
        order_type: match value.get("type").and_then(Value::as_str) {
            Some("LIMIT") => OrderType::Limit,
            _ => OrderType::Market,
        },
        status,
        quantity_base: fixed_field(value, "qty", base_decimals)?,
        filled_quantity_base: opt_fixed_field(value, "filledQty", base_decimals).unwrap_or(0),
        avg_fill_price_quote: opt_fixed_field(value, "avgPrice", price_decimals),
        timestamp: timestamp_field(value, "ts"),
    })
}

fn decode_levels(value: &Value, field: &str, price_decimals: u32, base_decimals: u32) -> Vec<BookLevel> {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    let entry = level.as_array()?;
                    Some(BookLevel {
                        price_quote: parse_fixed(entry.first()?.as_str()?, price_decimals)?,
                        qty_base: parse_fixed(entry.get(1)?.as_str()?, base_decimals)?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ExchangeAdapter for RestAdapter {
    async fn connect(&self) -> Result<(), ExchangeError> {
        // Credential probe; an auth failure here is fatal at startup.
        self.request(Method::GET, "/api/v1/account/ping", &[], None, true).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let value = self
            .request(Method::GET, "/api/v1/ticker", &[("symbol", symbol.to_string())], None, false)
            .await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            bid_quote: fixed_field(&value, "bid", self.config.price_decimals)?,
            ask_quote: fixed_field(&value, "ask", self.config.price_decimals)?,
            last_quote: fixed_field(&value, "last", self.config.price_decimals)?,
            volume_base: opt_fixed_field(&value, "volume", self.config.base_decimals).unwrap_or(0),
            timestamp: timestamp_field(&value, "ts"),
        })
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: Option<usize>,
    ) -> Result<OrderBook, ExchangeError> {
        let mut query = vec![("symbol", symbol.to_string())];
        if let Some(depth) = depth {
            query.push(("depth", depth.to_string()));
        }
        let value = self.request(Method::GET, "/api/v1/depth", &query, None, false).await?;
        Ok(OrderBook {
            symbol: symbol.to_string(),
            bids: decode_levels(&value, "bids", self.config.price_decimals, self.config.base_decimals),
            asks: decode_levels(&value, "asks", self.config.price_decimals, self.config.base_decimals),
            timestamp: timestamp_field(&value, "ts"),
        })
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, ExchangeError> {
        let value = self
            .request(Method::GET, "/api/v1/funding", &[("symbol", symbol.to_string())], None, false)
            .await?;
        // Funding arrives as a decimal fraction; bps is that at 4 decimals.
        let rate_bps = value
            .get("rate")
            .and_then(Value::as_str)
            .and_then(|raw| parse_fixed(raw, 4))
            .ok_or_else(|| ExchangeError::Validation("bad funding rate".into()))?;
        Ok(FundingRate {
            symbol: symbol.to_string(),
            rate_bps,
            next_funding_time: timestamp_field(&value, "nextFundingTs"),
            timestamp: timestamp_field(&value, "ts"),
        })
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance, ExchangeError> {
        let balances = self.get_balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == asset)
            .unwrap_or_else(|| Balance::new(asset, 0, 0)))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        let value = self.request(Method::GET, "/api/v1/account/balances", &[], None, true).await?;
        let entries = value
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Validation("missing balances".into()))?;
        entries
            .iter()
            .map(|entry| {
                Ok(Balance::new(
                    str_field(entry, "asset")?,
                    fixed_field(entry, "available", self.config.base_decimals)?,
                    fixed_field(entry, "held", self.config.base_decimals)?,
                ))
            })
            .collect()
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let value = self.request(Method::GET, "/api/v1/account/positions", &[], None, true).await?;
        let entries = value
            .get("positions")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Validation("missing positions".into()))?;
        entries
            .iter()
            .map(|entry| {
                Ok(Position {
                    symbol: str_field(entry, "symbol")?.to_string(),
                    side: match str_field(entry, "side")? {
                        "LONG" => Side::Long,
                        _ => Side::Short,
                    },
                    size_base: fixed_field(entry, "size", self.config.base_decimals)?,
                    entry_price_quote: fixed_field(entry, "entryPrice", self.config.price_decimals)?,
                    mark_price_quote: fixed_field(entry, "markPrice", self.config.price_decimals)?,
                    liquidation_price_quote: opt_fixed_field(
                        entry,
                        "liquidationPrice",
                        self.config.price_decimals,
                    ),
                    unrealized_pnl_quote: opt_fixed_field(
                        entry,
                        "unrealizedPnl",
                        self.config.price_decimals,
                    )
                    .unwrap_or(0),
                    leverage_bps: entry
                        .get("leverage")
                        .and_then(Value::as_i64)
                        .map(|l| l as i128 * 10_000)
                        .unwrap_or(10_000),
                    margin_quote: opt_fixed_field(entry, "margin", self.config.price_decimals)
                        .unwrap_or(0),
                })
            })
            .collect()
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        Ok(self.get_positions().await?.into_iter().find(|p| p.symbol == symbol))
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let mut query = Vec::new();
        if let Some(symbol) = symbol {
            query.push(("symbol", symbol.to_string()));
        }
        let value = self.request(Method::GET, "/api/v1/orders/open", &query, None, true).await?;
        let entries = value
            .get("orders")
            .and_then(Value::as_array)
            .ok_or_else(|| ExchangeError::Validation("missing orders".into()))?;
        entries
            .iter()
            .map(|entry| decode_order(entry, self.config.price_decimals, self.config.base_decimals))
            .collect()
    }

    async fn create_order(&self, request: OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let body = json!({
            "symbol": request.symbol,
            "market": match request.market {
                MarketKind::Spot => "spot",
                MarketKind::Perp => "perp",
            },
            "side": request.side.as_str(),
            "type": match request.order_type {
                OrderType::Market => "MARKET",
                OrderType::Limit => "LIMIT",
            },
            "qty": format_fixed(request.quantity_base, self.config.base_decimals),
            "price": request
                .price_quote
                .map(|p| format_fixed(p, self.config.price_decimals)),
            "timeInForce": request.time_in_force.map(|tif| match tif {
                TimeInForce::Gtc => "GTC",
                TimeInForce::Ioc => "IOC",
                TimeInForce::Fok => "FOK",
            }),
        });
        let value = self.request(Method::POST, "/api/v1/orders", &[], Some(body), true).await?;
        decode_order(&value, self.config.price_decimals, self.config.base_decimals)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        self.request(
            Method::DELETE,
            "/api/v1/orders",
            &[("orderId", exchange_order_id.to_string())],
            None,
            true,
        )
        .await
        .map(|_| ())
    }

    async fn get_order(&self, exchange_order_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        let value = self
            .request(
                Method::GET,
                "/api/v1/orders",
                &[("orderId", exchange_order_id.to_string())],
                None,
                true,
            )
            .await?;
        decode_order(&value, self.config.price_decimals, self.config.base_decimals)
    }

    fn stream_connector(&self) -> Arc<dyn StreamConnector> {
        self.connector.clone()
    }
}
