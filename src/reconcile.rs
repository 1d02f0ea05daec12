//! Reconciliation against exchange truth.
//!
//! Every cycle fetches balances, positions and open orders in parallel,
//! derives a position view from the pre-update snapshot, applies the truth
//! to the state store as one batch (REST wins), and classifies any drift.
//! The reconciler itself only updates the store and logs; alerting and mode
//! changes on critical findings belong to the caller.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::adapter::{ExchangeAdapter, ExchangeError, ExchangeOrder};
use crate::config::ReconcileConfig;
use crate::lifecycle::audit::AuditLog;
use crate::lifecycle::order::ManagedOrder;
use crate::policy::token_bucket::Namespace;
use crate::policy::RequestPolicy;
use crate::risk::liquidation_distance_bps;
use crate::state::{BotState, StateStore};
use crate::types::{diff_bps, Amount, Balance, DerivedPosition, PendingFill, Position, PositionSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionField {
    Open,
    Side,
    PerpQuantityBase,
    SpotQuantityBase,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionInconsistency {
    pub field: PositionField,
    pub severity: Severity,
    /// Size diff in bps of truth; zero for open/side mismatches.
    pub diff_bps: i128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInconsistency {
    pub asset: String,
    pub severity: Severity,
    pub diff_bps: i128,
    pub derived_total_base: Amount,
    pub authoritative_total_base: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub consistent: bool,
    pub position_inconsistencies: Vec<PositionInconsistency>,
    pub balance_inconsistencies: Vec<BalanceInconsistency>,
    pub corrected_position: DerivedPosition,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileReport {
    pub fn has_critical(&self) -> bool {
        self.position_inconsistencies.iter().any(|i| i.severity == Severity::Critical)
            || self.balance_inconsistencies.iter().any(|i| i.severity == Severity::Critical)
    }
}

// ─────────────────────────────────────────────────────────
// Pure derivation & comparison
// ─────────────────────────────────────────────────────────

/// Build the combined position view from a perp position, the spot balance
/// and fills not yet reflected in either.
pub fn derive_position(
    position: Option<&Position>,
    spot_balance: Option<&Balance>,
    pending_fills: &[PendingFill],
    base_decimals: u32,
) -> DerivedPosition {
    let mut spot_qty_base = spot_balance.map(|b| b.total_base).unwrap_or(0);
    for fill in pending_fills {
        if fill.market == crate::types::MarketKind::Spot {
            match fill.side {
                crate::types::OrderSide::Buy => spot_qty_base += fill.qty_base,
                crate::types::OrderSide::Sell => spot_qty_base -= fill.qty_base,
            }
        }
    }

    match position {
        Some(p) if p.size_base != 0 => DerivedPosition {
            open: true,
            side: Some(p.side),
            spot_qty_base,
            perp_qty_base: p.size_base,
            notional_quote: p.notional_quote(base_decimals),
            unrealized_pnl_quote: p.unrealized_pnl_quote,
            margin_used_quote: p.margin_quote,
            liquidation_distance_bps: liquidation_distance_bps(
                Some(p.side),
                p.mark_price_quote,
                p.liquidation_price_quote,
            ),
            source: PositionSource::Derived,
        },
        _ => DerivedPosition { spot_qty_base, ..DerivedPosition::flat() },
    }
}

fn size_severity(diff_bps: i128, tolerance_bps: i128) -> Severity {
    if diff_bps <= tolerance_bps {
        Severity::Warning
    } else {
        Severity::Critical
    }
}

/// Compare a derived view against the authoritative one. Returns the drift
/// list and the corrected position; when nothing drifted the corrected
/// position is the derived input itself.
pub fn reconcile_position(
    derived: &DerivedPosition,
    truth: &DerivedPosition,
    config: &ReconcileConfig,
) -> (Vec<PositionInconsistency>, DerivedPosition) {
    let mut inconsistencies = Vec::new();

    if derived.open != truth.open {
        inconsistencies.push(PositionInconsistency {
            field: PositionField::Open,
            severity: Severity::Critical,
            diff_bps: 0,
        });
    }
    if derived.side != truth.side {
        inconsistencies.push(PositionInconsistency {
            field: PositionField::Side,
            severity: Severity::Critical,
            diff_bps: 0,
        });
    }
    if derived.perp_qty_base != truth.perp_qty_base {
        let diff = diff_bps(derived.perp_qty_base, truth.perp_qty_base);
        inconsistencies.push(PositionInconsistency {
            field: PositionField::PerpQuantityBase,
            severity: size_severity(diff, config.size_tolerance_bps),
            diff_bps: diff,
        });
    }
    if derived.spot_qty_base != truth.spot_qty_base {
        let diff = diff_bps(derived.spot_qty_base, truth.spot_qty_base);
        inconsistencies.push(PositionInconsistency {
            field: PositionField::SpotQuantityBase,
            severity: size_severity(diff, config.size_tolerance_bps),
            diff_bps: diff,
        });
    }

    let corrected = if inconsistencies.is_empty() {
        derived.clone()
    } else {
        DerivedPosition { source: PositionSource::Reconciled, ..truth.clone() }
    };
    (inconsistencies, corrected)
}

/// Per-asset `total_base` drift of the pre-update balances against truth.
pub fn reconcile_balances(
    derived: &HashMap<String, Balance>,
    truth: &[Balance],
    config: &ReconcileConfig,
) -> Vec<BalanceInconsistency> {
    let mut inconsistencies = Vec::new();
    for authoritative in truth {
        let derived_total = derived.get(&authoritative.asset).map(|b| b.total_base).unwrap_or(0);
        if derived_total == authoritative.total_base {
            continue;
        }
        let diff = diff_bps(derived_total, authoritative.total_base);
        inconsistencies.push(BalanceInconsistency {
            asset: authoritative.asset.clone(),
            severity: if diff > config.balance_critical_bps {
                Severity::Critical
            } else {
                Severity::Warning
            },
            diff_bps: diff,
            derived_total_base: derived_total,
            authoritative_total_base: authoritative.total_base,
        });
    }
    inconsistencies
}

/// Keep tracked orders the venue still reports open, plus orders the venue
/// cannot know about yet (no exchange id).
pub fn merge_open_orders(
    tracked: &HashMap<String, ManagedOrder>,
    truth: &[ExchangeOrder],
) -> Vec<ManagedOrder> {
    tracked
        .values()
        .filter(|order| match &order.exchange_order_id {
            Some(id) => truth.iter().any(|t| &t.exchange_order_id == id),
            None => true,
        })
        .cloned()
        .collect()
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

pub struct Reconciler {
    adapter: Arc<dyn ExchangeAdapter>,
    policy: Arc<RequestPolicy>,
    store: Arc<StateStore>,
    audit: AuditLog,
    config: ReconcileConfig,
    perp_symbol: String,
    base_asset: String,
    base_decimals: u32,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        policy: Arc<RequestPolicy>,
        store: Arc<StateStore>,
        audit: AuditLog,
        config: ReconcileConfig,
        perp_symbol: String,
        base_asset: String,
        base_decimals: u32,
    ) -> Self {
        Self { adapter, policy, store, audit, config, perp_symbol, base_asset, base_decimals }
    }

    /// One reconciliation cycle.
    pub async fn run_once(&self) -> Result<ReconcileReport, ExchangeError> {
        // Truth fetch, all three in parallel.
        let (balances, positions, open_orders) = tokio::try_join!(
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_balances()),
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_positions()),
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_open_orders(None)),
        )?;

        // Pre-update snapshot and its derived view.
        let pre: BotState = self.store.snapshot().await;
        let derived_pre = derive_position(
            pre.positions.get(&self.perp_symbol),
            pre.balances.get(&self.base_asset),
            &[],
            self.base_decimals,
        );

        // Apply truth as one batch.
        let merged_orders = merge_open_orders(&pre.open_orders, &open_orders);
        self.store
            .update_account(balances.clone(), positions.clone(), merged_orders)
            .await;

        // Authoritative view from the fetched truth.
        let truth_balance = balances.iter().find(|b| b.asset == self.base_asset);
        let truth_position = positions.iter().find(|p| p.symbol == self.perp_symbol);
        let derived_truth =
            derive_position(truth_position, truth_balance, &[], self.base_decimals);

        let (position_inconsistencies, corrected_position) =
            reconcile_position(&derived_pre, &derived_truth, &self.config);
        let balance_inconsistencies =
            reconcile_balances(&pre.balances, &balances, &self.config);

        let report = ReconcileReport {
            consistent: position_inconsistencies.is_empty() && balance_inconsistencies.is_empty(),
            position_inconsistencies,
            balance_inconsistencies,
            corrected_position,
            timestamp: Utc::now(),
        };

        if report.has_critical() {
            warn!(
                position = report.position_inconsistencies.len(),
                balance = report.balance_inconsistencies.len(),
                "reconciliation found critical drift"
            );
        } else if !report.consistent {
            info!(
                position = report.position_inconsistencies.len(),
                balance = report.balance_inconsistencies.len(),
                "reconciliation found drift within tolerance"
            );
        } else {
            debug!("reconciliation consistent");
        }

        self.audit.reconcile_verdict(json!({
            "consistent": report.consistent,
            "positionInconsistencies": report.position_inconsistencies,
            "balanceInconsistencies": report.balance_inconsistencies,
        }));

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketKind, OrderSide, Side};

    fn position(size_base: Amount) -> Position {
        Position {
            symbol: "BTCUSDT".into(),
            side: Side::Short,
            size_base,
            entry_price_quote: 50_000_000_000,
            mark_price_quote: 50_000_000_000,
            liquidation_price_quote: Some(65_000_000_000),
            unrealized_pnl_quote: 0,
            leverage_bps: 10_000,
            margin_quote: 5_000_000_000,
        }
    }

    #[test]
    fn test_derive_flat() {
        let d = derive_position(None, None, &[], 8);
        assert!(!d.open);
        assert_eq!(d.side, None);
        assert_eq!(d.liquidation_distance_bps, 10_000);
    }

    #[test]
    fn test_derive_with_pending_spot_fills() {
        let balance = Balance::new("BTC", 50_000_000, 0);
        let fills = vec![
            PendingFill {
                market: MarketKind::Spot,
                side: OrderSide::Buy,
                qty_base: 30_000_000,
                price_quote: 50_000_000_000,
            },
            PendingFill {
                market: MarketKind::Spot,
                side: OrderSide::Sell,
                qty_base: 10_000_000,
                price_quote: 50_000_000_000,
            },
        ];
        let d = derive_position(Some(&position(100_000_000)), Some(&balance), &fills, 8);
        assert!(d.open);
        assert_eq!(d.spot_qty_base, 70_000_000);
        assert_eq!(d.perp_qty_base, 100_000_000);
        assert_eq!(d.notional_quote, 50_000_000_000);
    }

    #[test]
    fn test_critical_size_drift() {
        // Literal scenario: derived 101_000_000 vs truth 100_000_000 at
        // 10 bps tolerance → one critical perp-quantity inconsistency.
        let derived = derive_position(Some(&position(101_000_000)), None, &[], 8);
        let truth = derive_position(Some(&position(100_000_000)), None, &[], 8);
        let config = ReconcileConfig { size_tolerance_bps: 10, balance_critical_bps: 500 };

        let (inconsistencies, corrected) = reconcile_position(&derived, &truth, &config);
        assert_eq!(inconsistencies.len(), 1);
        assert_eq!(inconsistencies[0].field, PositionField::PerpQuantityBase);
        assert_eq!(inconsistencies[0].severity, Severity::Critical);
        assert_eq!(inconsistencies[0].diff_bps, 100);
        assert_eq!(corrected.perp_qty_base, 100_000_000);
        assert_eq!(corrected.source, PositionSource::Reconciled);
    }

    #[test]
    fn test_small_size_drift_is_warning() {
        let derived = derive_position(Some(&position(100_000_500)), None, &[], 8);
        let truth = derive_position(Some(&position(100_000_000)), None, &[], 8);
        let config = ReconcileConfig::default();
        let (inconsistencies, _) = reconcile_position(&derived, &truth, &config);
        assert_eq!(inconsistencies.len(), 1);
        assert_eq!(inconsistencies[0].severity, Severity::Warning);
    }

    #[test]
    fn test_open_and_side_are_always_critical() {
        let derived = derive_position(Some(&position(100)), None, &[], 8);
        let truth = derive_position(None, None, &[], 8);
        let (inconsistencies, corrected) =
            reconcile_position(&derived, &truth, &ReconcileConfig::default());
        assert!(inconsistencies
            .iter()
            .any(|i| i.field == PositionField::Open && i.severity == Severity::Critical));
        assert!(inconsistencies
            .iter()
            .any(|i| i.field == PositionField::Side && i.severity == Severity::Critical));
        assert!(!corrected.open);
    }

    #[test]
    fn test_consistent_view_round_trips() {
        // Law: corrected == derived whenever no drift is found.
        let balance = Balance::new("BTC", 100_000_000, 0);
        let derived = derive_position(Some(&position(100_000_000)), Some(&balance), &[], 8);
        let truth = derived.clone();
        let (inconsistencies, corrected) =
            reconcile_position(&derived, &truth, &ReconcileConfig::default());
        assert!(inconsistencies.is_empty());
        assert_eq!(corrected, derived);
    }

    #[test]
    fn test_balance_drift_classification() {
        let mut derived = HashMap::new();
        derived.insert("BTC".to_string(), Balance::new("BTC", 94_000_000, 0));
        derived.insert("USDT".to_string(), Balance::new("USDT", 1_000_000_000, 0));
        let truth = vec![
            Balance::new("BTC", 100_000_000, 0),   // 600 bps off → critical
            Balance::new("USDT", 1_000_100_000, 0), // ~1 bps off → warning
        ];
        let report = reconcile_balances(&derived, &truth, &ReconcileConfig::default());
        assert_eq!(report.len(), 2);
        let btc = report.iter().find(|i| i.asset == "BTC").unwrap();
        assert_eq!(btc.severity, Severity::Critical);
        assert_eq!(btc.diff_bps, 600);
        let usdt = report.iter().find(|i| i.asset == "USDT").unwrap();
        assert_eq!(usdt.severity, Severity::Warning);
    }

    #[test]
    fn test_merge_open_orders_drops_closed() {
        use crate::lifecycle::order::{OrderEvent, OrderStatus};
        use crate::types::OrderType;

        let mut tracked = HashMap::new();
        let acked = ManagedOrder::new(
            "i1",
            "BTCUSDT",
            MarketKind::Perp,
            OrderSide::Sell,
            OrderType::Market,
            100,
            None,
        )
        .apply(&OrderEvent::Submit)
        .unwrap()
        .apply(&OrderEvent::Ack { exchange_order_id: "X1".into() })
        .unwrap();
        tracked.insert(acked.id.clone(), acked.clone());

        let unsubmitted = ManagedOrder::new(
            "i2",
            "BTCUSDT",
            MarketKind::Spot,
            OrderSide::Buy,
            OrderType::Market,
            100,
            None,
        );
        tracked.insert(unsubmitted.id.clone(), unsubmitted.clone());

        // Venue no longer reports X1: it is gone from the merge, while the
        // not-yet-submitted order stays.
        let merged = merge_open_orders(&tracked, &[]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, OrderStatus::Created);
        assert_eq!(merged[0].id, unsubmitted.id);
    }
}
