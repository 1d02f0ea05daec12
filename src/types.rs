//! Core domain types shared across the bot.
//!
//! All monetary quantities are fixed-point `i128` with explicit unit
//! suffixes: `*_base` (base-asset units at `base_decimals`), `*_quote`
//! (quote-asset units), `*_bps` (basis points, scale 10_000). Floats never
//! touch money.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Basis-point scale: 1% = 100 bps, 100% = 10_000 bps.
pub const BPS_SCALE: i128 = 10_000;

/// Fixed-point monetary amount.
pub type Amount = i128;

/// Which direction a position or order takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }
}

/// Order direction on the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Which market a leg trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Perp,
}

/// Best-quote ticker snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid_quote: Amount,
    pub ask_quote: Amount,
    pub last_quote: Amount,
    pub volume_base: Amount,
    pub timestamp: DateTime<Utc>,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price_quote: Amount,
    pub qty_base: Amount,
}

/// Depth snapshot. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid_quote(&self) -> Option<Amount> {
        self.bids.first().map(|l| l.price_quote)
    }

    pub fn best_ask_quote(&self) -> Option<Amount> {
        self.asks.first().map(|l| l.price_quote)
    }
}

/// Perpetual funding-rate snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate_bps: i128,
    pub next_funding_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

/// Per-asset balance. Invariant: `total_base = available_base + held_base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub available_base: Amount,
    pub held_base: Amount,
    pub total_base: Amount,
}

impl Balance {
    pub fn new(asset: impl Into<String>, available_base: Amount, held_base: Amount) -> Self {
        Self {
            asset: asset.into(),
            available_base,
            held_base,
            total_base: available_base + held_base,
        }
    }
}

/// Exchange-reported derivative position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: Side,
    pub size_base: Amount,
    pub entry_price_quote: Amount,
    pub mark_price_quote: Amount,
    pub liquidation_price_quote: Option<Amount>,
    pub unrealized_pnl_quote: Amount,
    pub leverage_bps: i128,
    pub margin_quote: Amount,
}

impl Position {
    /// Notional value at mark, in quote units.
    pub fn notional_quote(&self, base_decimals: u32) -> Amount {
        self.size_base * self.mark_price_quote / 10_i128.pow(base_decimals)
    }

    /// Mark-to-market PnL from the entry price, in quote units.
    pub fn compute_unrealized_pnl_quote(&self, base_decimals: u32) -> Amount {
        let scale = 10_i128.pow(base_decimals);
        match self.side {
            Side::Long => self.size_base * (self.mark_price_quote - self.entry_price_quote) / scale,
            Side::Short => self.size_base * (self.entry_price_quote - self.mark_price_quote) / scale,
        }
    }
}

/// Where a derived position view came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSource {
    Derived,
    Reconciled,
}

/// A fill not yet reflected in exchange-reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFill {
    pub market: MarketKind,
    pub side: OrderSide,
    pub qty_base: Amount,
    pub price_quote: Amount,
}

/// Combined view over perp position, spot balance and pending fills.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedPosition {
    pub open: bool,
    pub side: Option<Side>,
    pub spot_qty_base: Amount,
    pub perp_qty_base: Amount,
    pub notional_quote: Amount,
    pub unrealized_pnl_quote: Amount,
    pub margin_used_quote: Amount,
    pub liquidation_distance_bps: i128,
    pub source: PositionSource,
}

impl DerivedPosition {
    pub fn flat() -> Self {
        Self {
            open: false,
            side: None,
            spot_qty_base: 0,
            perp_qty_base: 0,
            notional_quote: 0,
            unrealized_pnl_quote: 0,
            margin_used_quote: 0,
            liquidation_distance_bps: BPS_SCALE,
            source: PositionSource::Derived,
        }
    }
}

/// Integer square root by Newton's method. Returns 0 for non-positive input.
pub fn isqrt(value: i128) -> i128 {
    if value <= 0 {
        return 0;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

/// Absolute difference of `value` against `truth`, in bps of `truth`.
/// Returns `i128::MAX` when truth is zero but value is not.
pub fn diff_bps(value: Amount, truth: Amount) -> i128 {
    if truth == 0 {
        return if value == 0 { 0 } else { i128::MAX };
    }
    (value - truth).abs() * BPS_SCALE / truth.abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isqrt_exact_and_floor() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(3), 1);
        assert_eq!(isqrt(4), 2);
        assert_eq!(isqrt(24), 4);
        assert_eq!(isqrt(25), 5);
        assert_eq!(isqrt(10_000_000_000), 100_000);
    }

    #[test]
    fn test_diff_bps() {
        assert_eq!(diff_bps(101_000_000, 100_000_000), 100);
        assert_eq!(diff_bps(100_000_000, 100_000_000), 0);
        assert_eq!(diff_bps(0, 0), 0);
        assert_eq!(diff_bps(5, 0), i128::MAX);
    }

    #[test]
    fn test_balance_total_invariant() {
        let b = Balance::new("BTC", 70, 30);
        assert_eq!(b.total_base, b.available_base + b.held_base);
    }

    #[test]
    fn test_notional_and_pnl_one_btc_long() {
        // 1 BTC (8 decimals) long from 40k marked at 50k.
        let p = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            size_base: 100_000_000,
            entry_price_quote: 40_000_000_000,
            mark_price_quote: 50_000_000_000,
            liquidation_price_quote: None,
            unrealized_pnl_quote: 0,
            leverage_bps: 10_000,
            margin_quote: 0,
        };
        assert_eq!(p.notional_quote(8), 50_000_000_000);
        assert_eq!(p.compute_unrealized_pnl_quote(8), 10_000_000_000);
    }

    #[test]
    fn test_pnl_short_gains_when_mark_falls() {
        let p = Position {
            symbol: "BTCUSDT".into(),
            side: Side::Short,
            size_base: 100_000_000,
            entry_price_quote: 50_000_000_000,
            mark_price_quote: 48_000_000_000,
            liquidation_price_quote: None,
            unrealized_pnl_quote: 0,
            leverage_bps: 10_000,
            margin_quote: 0,
        };
        assert_eq!(p.compute_unrealized_pnl_quote(8), 2_000_000_000);
    }
}
