//! Risk evaluation.
//!
//! A pure function over a [`RiskSnapshot`]. Checks escalate monotonically:
//! each violated limit can only raise the level and action, never lower
//! them, so the outcome is independent of check order. All metrics are
//! integer bps.

use serde::{Deserialize, Serialize};

use crate::config::RiskConfig;
use crate::types::{Amount, Side, BPS_SCALE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Caution,
    Warning,
    Danger,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskAction {
    Allow,
    Pause,
    Exit,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskPositionView {
    pub side: Side,
    pub notional_quote: Amount,
    pub leverage_bps: i128,
    pub mark_price_quote: Amount,
    pub liquidation_price_quote: Option<Amount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub equity_quote: Amount,
    pub margin_used_quote: Amount,
    pub position: Option<RiskPositionView>,
    pub daily_pnl_quote: Amount,
    pub peak_equity_quote: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub notional_quote: Amount,
    pub leverage_bps: i128,
    pub margin_utilization_bps: i128,
    pub liquidation_distance_bps: i128,
    pub drawdown_bps: i128,
    pub daily_pnl_quote: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub action: RiskAction,
    pub reasons: Vec<String>,
    pub metrics: RiskMetrics,
}

impl RiskAssessment {
    pub fn allows_entry(&self) -> bool {
        self.action == RiskAction::Allow
    }
}

/// Adverse distance from mark to liquidation, in bps of mark.
/// 10_000 (100%) when there is no position or no liquidation price;
/// 0 when mark has crossed liquidation on the wrong side.
pub fn liquidation_distance_bps(
    side: Option<Side>,
    mark_price_quote: Amount,
    liquidation_price_quote: Option<Amount>,
) -> i128 {
    let (side, liq) = match (side, liquidation_price_quote) {
        (Some(side), Some(liq)) => (side, liq),
        _ => return BPS_SCALE,
    };
    if mark_price_quote <= 0 {
        return 0;
    }
    let raw = match side {
        Side::Long => (mark_price_quote - liq) * BPS_SCALE / mark_price_quote,
        Side::Short => (liq - mark_price_quote) * BPS_SCALE / mark_price_quote,
    };
    raw.max(0)
}

/// Margin in use as a fraction of equity, capped at 100%.
pub fn margin_utilization_bps(margin_used_quote: Amount, equity_quote: Amount) -> i128 {
    (margin_used_quote * BPS_SCALE / equity_quote.max(1)).min(BPS_SCALE)
}

/// Drawdown from the peak, in bps of peak. Zero when at or above peak.
pub fn drawdown_bps(equity_quote: Amount, peak_equity_quote: Amount) -> i128 {
    if peak_equity_quote <= 0 {
        return 0;
    }
    ((peak_equity_quote - equity_quote) * BPS_SCALE / peak_equity_quote).max(0)
}

pub fn evaluate(snapshot: &RiskSnapshot, config: &RiskConfig) -> RiskAssessment {
    let notional_quote = snapshot.position.as_ref().map(|p| p.notional_quote).unwrap_or(0);
    let leverage_bps = snapshot.position.as_ref().map(|p| p.leverage_bps).unwrap_or(0);
    let liquidation_distance = liquidation_distance_bps(
        snapshot.position.as_ref().map(|p| p.side),
        snapshot.position.as_ref().map(|p| p.mark_price_quote).unwrap_or(0),
        snapshot.position.as_ref().and_then(|p| p.liquidation_price_quote),
    );
    let margin_utilization = margin_utilization_bps(snapshot.margin_used_quote, snapshot.equity_quote);
    let drawdown = drawdown_bps(snapshot.equity_quote, snapshot.peak_equity_quote);

    let mut level = RiskLevel::Safe;
    let mut action = RiskAction::Allow;
    let mut reasons = Vec::new();
    let mut escalate = |l: RiskLevel, a: RiskAction, reason: String| {
        // never downgrade
        if l > level {
            level = l;
        }
        if a > action {
            action = a;
        }
        reasons.push(reason);
    };

    if notional_quote > config.max_position_notional_quote {
        escalate(
            RiskLevel::Blocked,
            RiskAction::Block,
            format!(
                "position notional {notional_quote} above max {}",
                config.max_position_notional_quote
            ),
        );
    }
    if leverage_bps > config.max_leverage_bps {
        escalate(
            RiskLevel::Blocked,
            RiskAction::Block,
            format!("leverage {leverage_bps}bps above max {}bps", config.max_leverage_bps),
        );
    }
    if snapshot.daily_pnl_quote < -config.max_daily_loss_quote {
        escalate(
            RiskLevel::Danger,
            RiskAction::Exit,
            format!(
                "daily pnl {} below loss limit -{}",
                snapshot.daily_pnl_quote, config.max_daily_loss_quote
            ),
        );
    }
    if drawdown > config.max_drawdown_bps {
        escalate(
            RiskLevel::Danger,
            RiskAction::Exit,
            format!("drawdown {drawdown}bps above max {}bps", config.max_drawdown_bps),
        );
    }
    if snapshot.position.is_some() && liquidation_distance < config.min_liquidation_distance_bps {
        escalate(
            RiskLevel::Danger,
            RiskAction::Exit,
            format!(
                "liquidation distance {liquidation_distance}bps below min {}bps",
                config.min_liquidation_distance_bps
            ),
        );
    }
    if margin_utilization > config.max_margin_utilization_bps {
        escalate(
            RiskLevel::Warning,
            RiskAction::Pause,
            format!(
                "margin utilization {margin_utilization}bps above max {}bps",
                config.max_margin_utilization_bps
            ),
        );
    }
    if notional_quote > config.warn_position_notional_quote {
        escalate(
            RiskLevel::Caution,
            RiskAction::Allow,
            format!(
                "position notional {notional_quote} above warn {}",
                config.warn_position_notional_quote
            ),
        );
    }
    if margin_utilization > config.warn_margin_utilization_bps {
        escalate(
            RiskLevel::Caution,
            RiskAction::Allow,
            format!(
                "margin utilization {margin_utilization}bps above warn {}bps",
                config.warn_margin_utilization_bps
            ),
        );
    }
    if snapshot.position.is_some() && liquidation_distance < config.warn_liquidation_distance_bps {
        escalate(
            RiskLevel::Caution,
            RiskAction::Allow,
            format!(
                "liquidation distance {liquidation_distance}bps below warn {}bps",
                config.warn_liquidation_distance_bps
            ),
        );
    }

    RiskAssessment {
        level,
        action,
        reasons,
        metrics: RiskMetrics {
            notional_quote,
            leverage_bps,
            margin_utilization_bps: margin_utilization,
            liquidation_distance_bps: liquidation_distance,
            drawdown_bps: drawdown,
            daily_pnl_quote: snapshot.daily_pnl_quote,
        },
    }
}
