//! Exchange adapter capability.
//!
//! The core is generic over one exchange behind this trait: REST lifecycle,
//! market data, account and order endpoints, plus a stream connector for the
//! push feeds. All numerics crossing this boundary are fixed-point integers
//! (`types::Amount`) at documented scales.

pub mod paper;
pub mod rest;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::manager::StreamConnector;
use crate::types::{Amount, Balance, FundingRate, MarketKind, OrderBook, OrderSide, OrderType, Position, Ticker};

// ─────────────────────────────────────────────────────────
// Error taxonomy — classified by behaviour, not by transport
// ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Socket drop, DNS, connection reset. Retryable.
    #[error("network error: {0}")]
    Network(String),

    /// Per-call deadline exceeded. Counts as a failure; retryable.
    #[error("request timed out")]
    Timeout,

    /// 5xx from the venue. Retryable.
    #[error("server error: status {status}")]
    Server { status: u16 },

    /// 429 or venue throttle. Retryable after the hinted delay.
    #[error("rate limited")]
    Throttled { retry_after: Option<Duration> },

    /// 401/403 or signature rejection. Never retried; fatal to the adapter.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Bad parameters, precision violation. Never retried.
    #[error("validation rejected: {0}")]
    Validation(String),

    /// Insufficient balance, order rejected, unknown order id. Never retried.
    #[error("business state: {0}")]
    Business(String),

    /// Impossible state. Propagates; the worker pauses.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExchangeError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Network(_)
                | ExchangeError::Timeout
                | ExchangeError::Server { .. }
                | ExchangeError::Throttled { .. }
        )
    }

    /// `Retry-After` hint, honored verbatim by the request policy.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExchangeError::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Order wire types
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub market: MarketKind,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity_base: Amount,
    pub price_quote: Option<Amount>,
    pub time_in_force: Option<TimeInForce>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

/// Exchange-side order status, as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeOrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl ExchangeOrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeOrderStatus::Filled | ExchangeOrderStatus::Canceled | ExchangeOrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub exchange_order_id: String,
    pub symbol: String,
    pub market: MarketKind,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: ExchangeOrderStatus,
    pub quantity_base: Amount,
    pub filled_quantity_base: Amount,
    pub avg_fill_price_quote: Option<Amount>,
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────
// Push events the stream connector decodes
// ─────────────────────────────────────────────────────────

/// Typed stream event, already decoded from venue frames.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Ticker(Ticker),
    MarkPrice {
        symbol: String,
        mark_price_quote: Amount,
        timestamp: DateTime<Utc>,
    },
    OrderUpdate(ExchangeOrder),
}

impl StreamEvent {
    /// Logical stream a payload belongs to, for health accounting.
    pub fn stream_name(&self) -> &'static str {
        match self {
            StreamEvent::Ticker(_) => "ticker",
            StreamEvent::MarkPrice { .. } => "mark",
            StreamEvent::OrderUpdate(_) => "orders",
        }
    }

    /// De-duplication key; replays across reconnects hash to the same key.
    pub fn dedup_key(&self) -> String {
        match self {
            StreamEvent::Ticker(t) => {
                format!("ticker|{}|{}", t.symbol, t.timestamp.timestamp_millis())
            }
            StreamEvent::MarkPrice { symbol, timestamp, .. } => {
                format!("mark|{}|{}", symbol, timestamp.timestamp_millis())
            }
            StreamEvent::OrderUpdate(o) => format!(
                "order|{}|{}|{}",
                o.exchange_order_id,
                o.filled_quantity_base,
                o.timestamp.timestamp_millis()
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Fixed-point decoding of venue decimal strings
// ─────────────────────────────────────────────────────────

/// Parse a decimal string (`"50123.45"`) into fixed-point at `decimals`.
/// Truncates extra fractional digits; rejects garbage rather than guessing.
pub fn parse_fixed(raw: &str, decimals: u32) -> Option<Amount> {
    let raw = raw.trim();
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let scale = 10_i128.checked_pow(decimals)?;
    let int_value: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac_digits: String = frac_part.chars().take(decimals as usize).collect();
    while (frac_digits.len() as u32) < decimals {
        frac_digits.push('0');
    }
    let frac_value: i128 =
        if frac_digits.is_empty() { 0 } else { frac_digits.parse().ok()? };

    let magnitude = int_value.checked_mul(scale)?.checked_add(frac_value)?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Render fixed-point back into the venue's decimal string form.
pub fn format_fixed(value: Amount, decimals: u32) -> String {
    let scale = 10_i128.pow(decimals);
    let sign = if value < 0 { "-" } else { "" };
    let magnitude = value.abs();
    if decimals == 0 {
        return format!("{sign}{magnitude}");
    }
    format!(
        "{sign}{}.{:0width$}",
        magnitude / scale,
        magnitude % scale,
        width = decimals as usize
    )
}

// ─────────────────────────────────────────────────────────
// Capability trait
// ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    // Lifecycle
    async fn connect(&self) -> Result<(), ExchangeError>;
    async fn disconnect(&self) -> Result<(), ExchangeError>;
    fn is_connected(&self) -> bool;

    // Market data
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    async fn get_order_book(&self, symbol: &str, depth: Option<usize>) -> Result<OrderBook, ExchangeError>;
    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, ExchangeError>;

    // Account
    async fn get_balance(&self, asset: &str) -> Result<Balance, ExchangeError>;
    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError>;
    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError>;
    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    // Orders
    async fn create_order(&self, request: OrderRequest) -> Result<ExchangeOrder, ExchangeError>;
    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError>;
    async fn get_order(&self, exchange_order_id: &str) -> Result<ExchangeOrder, ExchangeError>;

    /// Connector for the push feeds; each `connect` re-subscribes all
    /// channels, so the reconnect sequence holds by construction.
    fn stream_connector(&self) -> Arc<dyn StreamConnector>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::Timeout.is_retryable());
        assert!(ExchangeError::Server { status: 503 }.is_retryable());
        assert!(ExchangeError::Throttled { retry_after: None }.is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::Validation("precision".into()).is_retryable());
        assert!(!ExchangeError::Business("insufficient balance".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_hint_only_on_throttle() {
        let e = ExchangeError::Throttled { retry_after: Some(Duration::from_secs(7)) };
        assert_eq!(e.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ExchangeError::Timeout.retry_after(), None);
    }

    #[test]
    fn test_parse_fixed() {
        assert_eq!(parse_fixed("50123.45", 6), Some(50_123_450_000));
        assert_eq!(parse_fixed("0.00000001", 8), Some(1));
        assert_eq!(parse_fixed("-2.5", 2), Some(-250));
        assert_eq!(parse_fixed("7", 3), Some(7_000));
        assert_eq!(parse_fixed(".5", 1), Some(5));
        // Extra fractional digits truncate.
        assert_eq!(parse_fixed("1.23456789", 4), Some(12_345));
        assert_eq!(parse_fixed("", 2), None);
        assert_eq!(parse_fixed("1,5", 2), None);
        assert_eq!(parse_fixed("abc", 2), None);
    }

    #[test]
    fn test_format_fixed_round_trips() {
        assert_eq!(format_fixed(50_123_450_000, 6), "50123.450000");
        assert_eq!(format_fixed(-250, 2), "-2.50");
        assert_eq!(format_fixed(7, 0), "7");
        assert_eq!(parse_fixed(&format_fixed(123_456_789, 8), 8), Some(123_456_789));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExchangeOrderStatus::Filled.is_terminal());
        assert!(ExchangeOrderStatus::Canceled.is_terminal());
        assert!(ExchangeOrderStatus::Rejected.is_terminal());
        assert!(!ExchangeOrderStatus::New.is_terminal());
        assert!(!ExchangeOrderStatus::PartiallyFilled.is_terminal());
    }
}
