//! Funding-rate driven strategy.
//!
//! Purely functional: trend analysis over the recent funding window plus
//! the current risk assessment decide between NOOP, ENTER_HEDGE and
//! EXIT_HEDGE. All statistics are integer bps; the population standard
//! deviation uses the Newton integer square root.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::risk::{RiskAction, RiskAssessment};
use crate::types::{isqrt, Amount};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Increasing,
    Stable,
    Decreasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    HighStable,
    HighVolatile,
    LowStable,
    LowVolatile,
}

impl Regime {
    pub fn is_high(&self) -> bool {
        matches!(self, Regime::HighStable | Regime::HighVolatile)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub mean_bps: i128,
    pub stddev_bps: i128,
    pub trend: Trend,
    pub regime: Regime,
    /// Second-half mean minus first-half mean.
    pub delta_bps: i128,
}

/// Mean over `high` / stddev over `volatile` regime thresholds.
const HIGH_MEAN_BPS: i128 = 10;
const VOLATILE_STDDEV_BPS: i128 = 5;
/// Deadband around zero for the half-to-half trend delta.
const TREND_DEADBAND_BPS: i128 = 5;

/// Analyze the funding window. Needs at least two samples.
pub fn analyze_trend(rates_bps: &[i128]) -> Option<TrendAnalysis> {
    if rates_bps.len() < 2 {
        return None;
    }
    let n = rates_bps.len() as i128;
    let mean_bps = rates_bps.iter().sum::<i128>() / n;
    let variance = rates_bps.iter().map(|r| (r - mean_bps) * (r - mean_bps)).sum::<i128>() / n;
    let stddev_bps = isqrt(variance);

    let half = rates_bps.len() / 2;
    let first = &rates_bps[..half];
    let second = &rates_bps[rates_bps.len() - half..];
    let first_mean = first.iter().sum::<i128>() / half as i128;
    let second_mean = second.iter().sum::<i128>() / half as i128;
    let delta_bps = second_mean - first_mean;

    let trend = if delta_bps > TREND_DEADBAND_BPS {
        Trend::Increasing
    } else if delta_bps < -TREND_DEADBAND_BPS {
        Trend::Decreasing
    } else {
        Trend::Stable
    };

    let regime = match (mean_bps > HIGH_MEAN_BPS, stddev_bps > VOLATILE_STDDEV_BPS) {
        (true, false) => Regime::HighStable,
        (true, true) => Regime::HighVolatile,
        (false, false) => Regime::LowStable,
        (false, true) => Regime::LowVolatile,
    };

    Some(TrendAnalysis { mean_bps, stddev_bps, trend, regime, delta_bps })
}

// ─────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    PredictedBelowExit,
    TrendReversal,
    RegimeDropped,
    TargetYieldReached,
    RiskExit,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::PredictedBelowExit => "predicted_below_exit",
            ExitReason::TrendReversal => "trend_reversal",
            ExitReason::RegimeDropped => "regime_dropped",
            ExitReason::TargetYieldReached => "target_yield_reached",
            ExitReason::RiskExit => "risk_exit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Noop,
    EnterHedge { size_quote: Amount, confidence: Confidence },
    ExitHedge { reason: ExitReason },
}

#[derive(Debug, Clone)]
pub struct StrategyInputs<'a> {
    pub current_rate_bps: i128,
    pub trend: Option<&'a TrendAnalysis>,
    /// A hedge is currently on.
    pub holding: bool,
    /// Funding accrued since entry, bps of hedge notional.
    pub realized_yield_bps: i128,
    pub risk: &'a RiskAssessment,
}

/// Predicted next rate: current plus the observed half-to-half drift.
pub fn predict_rate_bps(current_rate_bps: i128, trend: &TrendAnalysis) -> i128 {
    current_rate_bps + trend.delta_bps
}

pub fn decide(inputs: &StrategyInputs<'_>, config: &StrategyConfig) -> Decision {
    let trend = match inputs.trend {
        Some(trend) => trend,
        None => return Decision::Noop,
    };
    let predicted_bps = predict_rate_bps(inputs.current_rate_bps, trend);

    if inputs.holding {
        let reason = if matches!(inputs.risk.action, RiskAction::Exit | RiskAction::Block) {
            Some(ExitReason::RiskExit)
        } else if predicted_bps < config.exit_funding_rate_bps {
            Some(ExitReason::PredictedBelowExit)
        } else if trend.trend == Trend::Decreasing {
            // Entry required a non-decreasing trend, so this is a reversal.
            Some(ExitReason::TrendReversal)
        } else if !trend.regime.is_high() {
            Some(ExitReason::RegimeDropped)
        } else if inputs.realized_yield_bps >= config.target_yield_bps {
            Some(ExitReason::TargetYieldReached)
        } else {
            None
        };
        return match reason {
            Some(reason) => Decision::ExitHedge { reason },
            None => Decision::Noop,
        };
    }

    // Entry gate, all conditions required.
    let rate_ok = inputs.current_rate_bps >= config.min_funding_rate_bps;
    let predicted_ok = predicted_bps >= inputs.current_rate_bps
        || predicted_bps >= config.min_funding_rate_bps;
    let trend_ok = trend.trend != Trend::Decreasing;
    let regime_ok = trend.regime.is_high();
    let risk_ok = inputs.risk.action == RiskAction::Allow;

    if !(rate_ok && predicted_ok && trend_ok && regime_ok && risk_ok) {
        return Decision::Noop;
    }

    let strong_signals = [
        predicted_bps >= inputs.current_rate_bps,
        trend.trend != Trend::Decreasing,
        trend.regime == Regime::HighStable,
    ]
    .iter()
    .filter(|s| **s)
    .count();
    let confidence = match strong_signals {
        3 => Confidence::High,
        2 => Confidence::Medium,
        _ => Confidence::Low,
    };

    Decision::EnterHedge { size_quote: config.entry_size_quote, confidence }
}

// ─────────────────────────────────────────────────────────
// Funding window
// ─────────────────────────────────────────────────────────

/// Rolling window of funding snapshots, newest last.
#[derive(Debug)]
pub struct FundingWindow {
    rates_bps: VecDeque<i128>,
    capacity: usize,
}

impl FundingWindow {
    pub fn new(capacity: usize) -> Self {
        Self { rates_bps: VecDeque::with_capacity(capacity.max(2)), capacity: capacity.max(2) }
    }

    pub fn push(&mut self, rate_bps: i128) {
        if self.rates_bps.len() == self.capacity {
            self.rates_bps.pop_front();
        }
        self.rates_bps.push_back(rate_bps);
    }

    pub fn analyze(&self) -> Option<TrendAnalysis> {
        let rates: Vec<i128> = self.rates_bps.iter().copied().collect();
        analyze_trend(&rates)
    }

    pub fn len(&self) -> usize {
        self.rates_bps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates_bps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::risk::{evaluate, RiskSnapshot};

    fn safe_risk() -> RiskAssessment {
        evaluate(
            &RiskSnapshot {
                equity_quote: 20_000_000_000,
                margin_used_quote: 0,
                position: None,
                daily_pnl_quote: 0,
                peak_equity_quote: 20_000_000_000,
            },
            &RiskConfig::default(),
        )
    }

    #[test]
    fn test_trend_statistics() {
        let t = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        assert_eq!(t.mean_bps, 50);
        assert_eq!(t.delta_bps, 3);
        assert_eq!(t.trend, Trend::Stable);
        assert_eq!(t.regime, Regime::HighStable);
    }

    #[test]
    fn test_trend_classification_deadband() {
        assert_eq!(analyze_trend(&[40, 40, 40, 52, 52, 52]).unwrap().trend, Trend::Increasing);
        assert_eq!(analyze_trend(&[52, 52, 52, 40, 40, 40]).unwrap().trend, Trend::Decreasing);
        assert_eq!(analyze_trend(&[50, 50, 50, 52, 52, 52]).unwrap().trend, Trend::Stable);
    }

    #[test]
    fn test_regime_quadrants() {
        assert_eq!(analyze_trend(&[50, 50, 50, 50]).unwrap().regime, Regime::HighStable);
        assert_eq!(analyze_trend(&[30, 70, 20, 80]).unwrap().regime, Regime::HighVolatile);
        assert_eq!(analyze_trend(&[2, 3, 2, 3]).unwrap().regime, Regime::LowStable);
        assert_eq!(analyze_trend(&[-20, 20, -20, 20]).unwrap().regime, Regime::LowVolatile);
    }

    #[test]
    fn test_entry_high_confidence() {
        // Literal scenario: current 50, window [48..53], safe risk.
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 50,
                trend: Some(&trend),
                holding: false,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        match decision {
            Decision::EnterHedge { confidence, size_quote } => {
                assert_eq!(confidence, Confidence::High);
                assert_eq!(size_quote, StrategyConfig::default().entry_size_quote);
            }
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn test_no_entry_below_threshold() {
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 5, // below min 10
                trend: Some(&trend),
                holding: false,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::Noop);
    }

    #[test]
    fn test_no_entry_on_decreasing_trend() {
        let trend = analyze_trend(&[60, 60, 60, 40, 40, 40]).unwrap();
        assert_eq!(trend.trend, Trend::Decreasing);
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 40,
                trend: Some(&trend),
                holding: false,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::Noop);
    }

    #[test]
    fn test_no_entry_in_low_regime() {
        let trend = analyze_trend(&[2, 2, 2, 3, 3, 3]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 12,
                trend: Some(&trend),
                holding: false,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::Noop);
    }

    #[test]
    fn test_no_entry_when_risk_pauses() {
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let mut risk = safe_risk();
        risk.action = RiskAction::Pause;
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 50,
                trend: Some(&trend),
                holding: false,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::Noop);
    }

    #[test]
    fn test_exit_on_trend_reversal() {
        let trend = analyze_trend(&[60, 60, 60, 40, 40, 40]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 40,
                trend: Some(&trend),
                holding: true,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::ExitHedge { reason: ExitReason::TrendReversal });
    }

    #[test]
    fn test_exit_on_predicted_below_threshold() {
        // Stable high regime but collapsing prediction.
        let trend = analyze_trend(&[14, 14, 14, 12, 12, 12]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 4,
                trend: Some(&trend),
                holding: true,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::ExitHedge { reason: ExitReason::PredictedBelowExit });
    }

    #[test]
    fn test_exit_on_target_yield() {
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 50,
                trend: Some(&trend),
                holding: true,
                realized_yield_bps: 150,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::ExitHedge { reason: ExitReason::TargetYieldReached });
    }

    #[test]
    fn test_exit_on_risk_override() {
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let mut risk = safe_risk();
        risk.action = RiskAction::Exit;
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 50,
                trend: Some(&trend),
                holding: true,
                realized_yield_bps: 0,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::ExitHedge { reason: ExitReason::RiskExit });
    }

    #[test]
    fn test_holding_in_healthy_regime_is_noop() {
        let trend = analyze_trend(&[48, 49, 50, 51, 52, 53]).unwrap();
        let risk = safe_risk();
        let decision = decide(
            &StrategyInputs {
                current_rate_bps: 50,
                trend: Some(&trend),
                holding: true,
                realized_yield_bps: 10,
                risk: &risk,
            },
            &StrategyConfig::default(),
        );
        assert_eq!(decision, Decision::Noop);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut w = FundingWindow::new(4);
        for rate in [1, 2, 3, 4, 5, 6] {
            w.push(rate);
        }
        assert_eq!(w.len(), 4);
        // Oldest entries dropped: mean of [3,4,5,6] floors to 4.
        assert_eq!(w.analyze().unwrap().mean_bps, 4);
    }
}
