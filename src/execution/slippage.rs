//! Pre-trade slippage estimation.
//!
//! Walks the relevant side of the book (asks for BUY, bids for SELL),
//! accumulating base and quote until the requested quantity is covered or
//! the book runs out. Slippage is the weighted-average fill price against
//! the mid, in bps; price improvement reads as zero.

use serde::{Deserialize, Serialize};

use crate::config::SlippageConfig;
use crate::types::{Amount, OrderBook, OrderSide, BPS_SCALE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlippageEstimate {
    pub can_execute: bool,
    pub avg_fill_price_quote: Amount,
    pub mid_price_quote: Amount,
    pub estimated_slippage_bps: i128,
    pub available_depth_base: Amount,
    pub required_depth_base: Amount,
}

/// Integer mid price; 0 when either side is empty.
pub fn mid_price_quote(book: &OrderBook) -> Amount {
    match (book.best_bid_quote(), book.best_ask_quote()) {
        (Some(bid), Some(ask)) => (bid + ask) / 2,
        _ => 0,
    }
}

pub fn estimate(
    book: &OrderBook,
    side: OrderSide,
    quantity_base: Amount,
    config: &SlippageConfig,
) -> SlippageEstimate {
    let levels = match side {
        OrderSide::Buy => &book.asks,
        OrderSide::Sell => &book.bids,
    };

    let mid = mid_price_quote(book);
    let available_depth_base: Amount = levels.iter().map(|l| l.qty_base).sum();
    let required_depth_base = quantity_base * config.min_liquidity_multiplier;

    let mut remaining_base = quantity_base;
    let mut filled_base: Amount = 0;
    let mut weighted_quote: Amount = 0;
    for level in levels {
        if remaining_base == 0 {
            break;
        }
        let take_base = level.qty_base.min(remaining_base);
        weighted_quote += level.price_quote * take_base;
        filled_base += take_base;
        remaining_base -= take_base;
    }

    let avg_fill_price_quote = if filled_base > 0 { weighted_quote / filled_base } else { 0 };

    let estimated_slippage_bps = if mid > 0 && filled_base > 0 {
        let adverse = match side {
            OrderSide::Buy => avg_fill_price_quote - mid,
            OrderSide::Sell => mid - avg_fill_price_quote,
        };
        (adverse * BPS_SCALE / mid).max(0)
    } else {
        0
    };

    let enough_depth =
        remaining_base == 0 && available_depth_base >= required_depth_base && mid > 0;
    let can_execute = enough_depth && estimated_slippage_bps <= config.max_slippage_bps;

    SlippageEstimate {
        can_execute,
        avg_fill_price_quote,
        mid_price_quote: mid,
        estimated_slippage_bps,
        available_depth_base,
        required_depth_base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::BookLevel;

    fn book(bids: &[(Amount, Amount)], asks: &[(Amount, Amount)]) -> OrderBook {
        OrderBook {
            symbol: "BTCUSDT".into(),
            bids: bids.iter().map(|&(p, q)| BookLevel { price_quote: p, qty_base: q }).collect(),
            asks: asks.iter().map(|&(p, q)| BookLevel { price_quote: p, qty_base: q }).collect(),
            timestamp: Utc::now(),
        }
    }

    fn config() -> SlippageConfig {
        SlippageConfig { max_slippage_bps: 30, warn_slippage_bps: 15, min_liquidity_multiplier: 2 }
    }

    #[test]
    fn test_empty_book() {
        let est = estimate(&book(&[], &[]), OrderSide::Buy, 100, &config());
        assert!(!est.can_execute);
        assert_eq!(est.mid_price_quote, 0);
        assert_eq!(est.available_depth_base, 0);
    }

    #[test]
    fn test_one_sided_book_has_zero_mid() {
        let est = estimate(&book(&[(99, 100)], &[]), OrderSide::Buy, 10, &config());
        assert_eq!(est.mid_price_quote, 0);
        assert!(!est.can_execute);
    }

    #[test]
    fn test_buy_walks_asks() {
        // mid = (99 + 101) / 2 = 100
        let b = book(&[(99, 1_000)], &[(101, 50), (102, 100), (103, 1_000)]);
        let est = estimate(&b, OrderSide::Buy, 100, &config());
        // 50 @ 101 + 50 @ 102 → avg 101 (integer division of 10150/100).
        assert_eq!(est.avg_fill_price_quote, 101);
        assert_eq!(est.mid_price_quote, 100);
        // (101 - 100) * 10000 / 100 = 100 bps > max 30.
        assert_eq!(est.estimated_slippage_bps, 100);
        assert!(!est.can_execute);
    }

    #[test]
    fn test_tight_book_executes() {
        let b = book(
            &[(99_990_000, 1_000_000)],
            &[(100_010_000, 1_000_000), (100_020_000, 1_000_000)],
        );
        let est = estimate(&b, OrderSide::Buy, 500_000, &config());
        // avg = best ask, mid ~ 100_000_000: 1 bps adverse.
        assert!(est.estimated_slippage_bps <= 2);
        assert!(est.can_execute);
    }

    #[test]
    fn test_sell_walks_bids() {
        let b = book(&[(100_000, 80), (99_000, 80)], &[(100_200, 500)]);
        let est = estimate(&b, OrderSide::Sell, 100, &config());
        // 80 @ 100000 + 20 @ 99000 → avg 99800.
        assert_eq!(est.avg_fill_price_quote, 99_800);
        assert_eq!(est.mid_price_quote, 100_100);
        assert!(est.estimated_slippage_bps > 0);
    }

    #[test]
    fn test_insufficient_depth_blocks() {
        let b = book(&[(99, 1_000)], &[(101, 60)]);
        let est = estimate(&b, OrderSide::Buy, 100, &config());
        assert_eq!(est.available_depth_base, 60);
        assert_eq!(est.required_depth_base, 200);
        assert!(!est.can_execute);
    }

    #[test]
    fn test_liquidity_multiplier_blocks_even_when_fillable() {
        // Book can fill 100 but holds only 150 < 100 * 2.
        let b = book(&[(99_990, 1_000)], &[(100_010, 150)]);
        let est = estimate(&b, OrderSide::Buy, 100, &config());
        assert_eq!(est.available_depth_base, 150);
        assert!(!est.can_execute);
    }

    #[test]
    fn test_price_improvement_is_zero_slippage() {
        // Selling into a bid above mid cannot report negative slippage.
        let b = book(&[(100_200, 500)], &[(100_210, 500)]);
        let est = estimate(&b, OrderSide::Sell, 100, &config());
        assert_eq!(est.estimated_slippage_bps, 0);
    }
}
