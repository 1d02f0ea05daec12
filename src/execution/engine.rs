//! Execution engine.
//!
//! Turns trade intents into serial jobs on the execution queue. Each job
//! re-checks risk against the live snapshot (two-phase), gates on slippage
//! and depth, drives the perp and spot legs through the order state machine
//! with bounded fill polling and partial-fill completion, corrects hedge
//! drift, and writes every transition to the audit log. Failures feed the
//! execution circuit breaker; pre-trade gate rejections abort the job
//! without tripping it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{
    ExchangeAdapter, ExchangeError, ExchangeOrder, ExchangeOrderStatus, OrderRequest,
};
use crate::config::BotConfig;
use crate::execution::queue::{CancelSignal, JobError, JobHandle, SerialQueue};
use crate::execution::slippage::{self, SlippageEstimate};
use crate::lifecycle::audit::{AlertSeverity, AuditLog};
use crate::lifecycle::hedge::{HedgeMachine, HedgeState};
use crate::lifecycle::order::{ManagedOrder, OrderEvent};
use crate::policy::circuit::{CircuitBreaker, CircuitState};
use crate::policy::token_bucket::Namespace;
use crate::policy::RequestPolicy;
use crate::risk::{self, RiskAction, RiskAssessment, RiskPositionView, RiskSnapshot};
use crate::state::{BotState, StateStore};
use crate::types::{Amount, MarketKind, OrderSide, OrderType, BPS_SCALE};

// ─────────────────────────────────────────────────────────
// Intents & outcomes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnterHedgeIntent {
    pub intent_id: String,
    pub size_quote: Amount,
}

#[derive(Debug, Clone)]
pub struct ExitHedgeIntent {
    pub intent_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    ExecutionCircuitBreakerOpen,
    RiskRejected { action: RiskAction },
    SlippageTooHigh { estimated_bps: i128 },
    InsufficientLiquidity,
    MarketDataUnavailable,
    HedgeAlreadyActive,
    NoActiveHedge,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::ExecutionCircuitBreakerOpen => "execution_circuit_breaker_open",
            AbortReason::RiskRejected { .. } => "risk_rejected",
            AbortReason::SlippageTooHigh { .. } => "slippage_too_high",
            AbortReason::InsufficientLiquidity => "insufficient_liquidity",
            AbortReason::MarketDataUnavailable => "market_data_unavailable",
            AbortReason::HedgeAlreadyActive => "hedge_already_active",
            AbortReason::NoActiveHedge => "no_active_hedge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Entered {
        intent_id: String,
        notional_quote: Amount,
        spot_qty_base: Amount,
        perp_qty_base: Amount,
    },
    Exited {
        intent_id: String,
        pnl_quote: Amount,
    },
    Aborted {
        intent_id: String,
        reason: AbortReason,
    },
}

/// Fill summary for one hedge leg after completion.
#[derive(Debug, Clone, Copy)]
struct LegFill {
    filled_base: Amount,
    avg_price_quote: Amount,
}

impl LegFill {
    fn notional_quote(&self, base_decimals: u32) -> Amount {
        self.filled_base * self.avg_price_quote / 10_i128.pow(base_decimals)
    }
}

/// Leg failure. Carries whatever already filled so the caller can unwind
/// real exposure instead of forgetting it.
#[derive(Debug)]
struct LegError {
    filled: LegFill,
    cancelled: bool,
    reason: String,
}

impl LegError {
    fn into_job_error(self) -> JobError {
        if self.cancelled {
            JobError::Cancelled
        } else {
            JobError::Failed(self.reason)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Risk snapshot from live state
// ─────────────────────────────────────────────────────────

/// Running PnL figures the worker maintains across the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountMetrics {
    pub daily_pnl_quote: Amount,
    pub peak_equity_quote: Amount,
}

pub fn build_risk_snapshot(
    state: &BotState,
    metrics: &AccountMetrics,
    perp_symbol: &str,
    quote_asset: &str,
    base_decimals: u32,
) -> RiskSnapshot {
    let quote_balance = state.balances.get(quote_asset).map(|b| b.total_base).unwrap_or(0);
    let unrealized: Amount = state.positions.values().map(|p| p.unrealized_pnl_quote).sum();
    let margin_used: Amount = state.positions.values().map(|p| p.margin_quote).sum();
    let equity_quote = quote_balance + unrealized;

    let position = state.positions.get(perp_symbol).map(|p| RiskPositionView {
        side: p.side,
        notional_quote: p.notional_quote(base_decimals),
        leverage_bps: p.leverage_bps,
        mark_price_quote: p.mark_price_quote,
        liquidation_price_quote: p.liquidation_price_quote,
    });

    RiskSnapshot {
        equity_quote,
        margin_used_quote: margin_used,
        position,
        daily_pnl_quote: metrics.daily_pnl_quote,
        peak_equity_quote: metrics.peak_equity_quote.max(equity_quote),
    }
}

/// Hedge drift: notional mismatch between legs, in bps of the perp leg.
pub fn hedge_drift_bps(perp_notional_quote: Amount, spot_notional_quote: Amount) -> i128 {
    if perp_notional_quote == 0 {
        return 0;
    }
    (perp_notional_quote - spot_notional_quote).abs() * BPS_SCALE / perp_notional_quote
}

// ─────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────

/// Everything a job needs, clonable into the `'static` job future.
#[derive(Clone)]
struct JobCtx {
    adapter: Arc<dyn ExchangeAdapter>,
    policy: Arc<RequestPolicy>,
    store: Arc<StateStore>,
    audit: AuditLog,
    circuit: Arc<CircuitBreaker>,
    hedge: Arc<Mutex<HedgeMachine>>,
    metrics: Arc<Mutex<AccountMetrics>>,
    config: Arc<BotConfig>,
}

pub struct ExecutionEngine {
    ctx: JobCtx,
    queue: Arc<SerialQueue<ExecutionOutcome>>,
}

impl ExecutionEngine {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        policy: Arc<RequestPolicy>,
        store: Arc<StateStore>,
        audit: AuditLog,
        circuit: Arc<CircuitBreaker>,
        config: Arc<BotConfig>,
    ) -> Self {
        Self {
            ctx: JobCtx {
                adapter,
                policy,
                store,
                audit,
                circuit,
                hedge: Arc::new(Mutex::new(HedgeMachine::new())),
                metrics: Arc::new(Mutex::new(AccountMetrics::default())),
                config,
            },
            queue: SerialQueue::new(),
        }
    }

    pub fn metrics(&self) -> Arc<Mutex<AccountMetrics>> {
        self.ctx.metrics.clone()
    }

    pub async fn hedge_state(&self) -> HedgeState {
        self.ctx.hedge.lock().await.state().clone()
    }

    pub async fn hedge_engaged(&self) -> bool {
        self.ctx.hedge.lock().await.state().is_engaged()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.ctx.circuit.state()
    }

    pub fn submit_enter(&self, intent: EnterHedgeIntent) -> JobHandle<ExecutionOutcome> {
        let ctx = self.ctx.clone();
        self.queue.enqueue(Box::new(move |cancel| {
            Box::pin(async move { run_with_circuit(ctx, cancel, JobKind::Enter(intent)).await })
        }))
    }

    pub fn submit_exit(&self, intent: ExitHedgeIntent) -> JobHandle<ExecutionOutcome> {
        let ctx = self.ctx.clone();
        self.queue.enqueue(Box::new(move |cancel| {
            Box::pin(async move { run_with_circuit(ctx, cancel, JobKind::Exit(intent)).await })
        }))
    }

    /// A job is queued or running.
    pub fn is_busy(&self) -> bool {
        self.queue.depth() > 0
    }

    pub fn cancel_all(&self) {
        self.queue.cancel_all();
    }

    pub async fn wait_for_idle(&self) {
        self.queue.wait_for_idle().await;
    }
}

enum JobKind {
    Enter(EnterHedgeIntent),
    Exit(ExitHedgeIntent),
}

async fn run_with_circuit(
    ctx: JobCtx,
    cancel: CancelSignal,
    kind: JobKind,
) -> Result<ExecutionOutcome, JobError> {
    let intent_id = match &kind {
        JobKind::Enter(i) => i.intent_id.clone(),
        JobKind::Exit(i) => i.intent_id.clone(),
    };

    if !ctx.circuit.allow() {
        ctx.audit.alert(
            AlertSeverity::Critical,
            "EXECUTION_CIRCUIT_BREAKER_OPEN",
            json!({ "intentId": intent_id }),
        );
        return Ok(ExecutionOutcome::Aborted {
            intent_id,
            reason: AbortReason::ExecutionCircuitBreakerOpen,
        });
    }

    let result = match kind {
        JobKind::Enter(intent) => run_enter(&ctx, &cancel, intent).await,
        JobKind::Exit(intent) => run_exit(&ctx, &cancel, intent).await,
    };

    match &result {
        Ok(ExecutionOutcome::Aborted { .. }) => {}
        Ok(_) => ctx.circuit.record_success(),
        Err(JobError::Cancelled) => {}
        Err(JobError::Failed(_)) => {
            ctx.circuit.record_failure();
            if ctx.circuit.state() == CircuitState::Open {
                ctx.audit.alert(
                    AlertSeverity::Critical,
                    "EXECUTION_CIRCUIT_BREAKER_OPEN",
                    json!({ "intentId": intent_id }),
                );
            }
        }
    }
    result
}

// ─────────────────────────────────────────────────────────
// ENTER_HEDGE
// ─────────────────────────────────────────────────────────

async fn run_enter(
    ctx: &JobCtx,
    cancel: &CancelSignal,
    intent: EnterHedgeIntent,
) -> Result<ExecutionOutcome, JobError> {
    let config = &ctx.config;
    let intent_id = intent.intent_id.clone();

    {
        let hedge = ctx.hedge.lock().await;
        if hedge.state().is_engaged() {
            return Ok(ExecutionOutcome::Aborted {
                intent_id,
                reason: AbortReason::HedgeAlreadyActive,
            });
        }
    }

    // Two-phase risk: the world may have moved since the decision tick.
    let state = ctx.store.snapshot().await;
    let metrics = *ctx.metrics.lock().await;
    let assessment: RiskAssessment = risk::evaluate(
        &build_risk_snapshot(
            &state,
            &metrics,
            &config.perp_symbol,
            &config.quote_asset,
            config.base_decimals,
        ),
        &config.risk,
    );
    if matches!(assessment.action, RiskAction::Block | RiskAction::Exit) {
        warn!(intent_id = %intent_id, action = ?assessment.action, "entry vetoed at execution time");
        return Ok(ExecutionOutcome::Aborted {
            intent_id,
            reason: AbortReason::RiskRejected { action: assessment.action },
        });
    }
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    // Slippage gate on a fresh book.
    let book = ctx
        .policy
        .execute(Namespace::Public, 1, || {
            ctx.adapter.get_order_book(&config.spot_symbol, None)
        })
        .await
        .map_err(|e| JobError::Failed(format!("order book fetch: {e}")))?;
    let mid = slippage::mid_price_quote(&book);
    if mid <= 0 {
        return Ok(ExecutionOutcome::Aborted {
            intent_id,
            reason: AbortReason::MarketDataUnavailable,
        });
    }
    let qty_base = intent.size_quote * 10_i128.pow(config.base_decimals) / mid;
    if qty_base <= 0 {
        return Ok(ExecutionOutcome::Aborted {
            intent_id,
            reason: AbortReason::MarketDataUnavailable,
        });
    }

    for side in [OrderSide::Buy, OrderSide::Sell] {
        let estimate: SlippageEstimate = slippage::estimate(&book, side, qty_base, &config.slippage);
        if !estimate.can_execute {
            let reason = if estimate.estimated_slippage_bps > config.slippage.max_slippage_bps {
                AbortReason::SlippageTooHigh { estimated_bps: estimate.estimated_slippage_bps }
            } else {
                AbortReason::InsufficientLiquidity
            };
            warn!(intent_id = %intent_id, ?side, reason = reason.as_str(), "pre-trade gate rejected entry");
            return Ok(ExecutionOutcome::Aborted { intent_id, reason });
        }
        if estimate.estimated_slippage_bps > config.slippage.warn_slippage_bps {
            ctx.audit.alert(
                AlertSeverity::Warning,
                "SLIPPAGE_NEAR_LIMIT",
                json!({ "intentId": intent_id, "estimatedBps": estimate.estimated_slippage_bps }),
            );
        }
    }
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    hedge_transition(ctx, HedgeState::EnteringPerp { intent_id: intent_id.clone() }, "ENTER", &intent_id)
        .await?;

    // Perp short leg.
    let perp = match fill_leg(ctx, cancel, &intent_id, MarketKind::Perp, OrderSide::Sell, qty_base).await
    {
        Ok(fill) => fill,
        Err(leg) => {
            if leg.filled.filled_base > 0 {
                // Partial perp exposure already exists: unwind it.
                unwind_entry(ctx, &intent_id, leg.filled, 0).await;
            } else {
                let _ = hedge_transition(ctx, HedgeState::Idle, "ENTER_FAILED", &intent_id).await;
            }
            return Err(leg.into_job_error());
        }
    };
    hedge_transition(
        ctx,
        HedgeState::EnteringSpot { perp_filled_base: perp.filled_base },
        "PERP_FILLED",
        &intent_id,
    )
    .await?;

    // Spot long leg.
    let spot = match fill_leg(ctx, cancel, &intent_id, MarketKind::Spot, OrderSide::Buy, perp.filled_base)
        .await
    {
        Ok(fill) => fill,
        Err(leg) => {
            // Naked perp (plus any partial spot): unwind before giving up.
            unwind_entry(ctx, &intent_id, perp, leg.filled.filled_base).await;
            return Err(leg.into_job_error());
        }
    };

    // Drift check, correcting the under-sized leg.
    let mut perp_notional = perp.notional_quote(config.base_decimals);
    let mut spot_notional = spot.notional_quote(config.base_decimals);
    let mut spot_filled = spot.filled_base;
    let mut perp_filled = perp.filled_base;
    let drift = hedge_drift_bps(perp_notional, spot_notional);
    if drift > config.execution.max_drift_bps {
        info!(intent_id = %intent_id, drift_bps = drift, "correcting hedge drift");
        let (market, side, price) = if spot_notional < perp_notional {
            (MarketKind::Spot, OrderSide::Buy, spot.avg_price_quote)
        } else {
            (MarketKind::Perp, OrderSide::Sell, perp.avg_price_quote)
        };
        let missing_quote = (perp_notional - spot_notional).abs();
        let missing_base = missing_quote * 10_i128.pow(config.base_decimals) / price.max(1);
        if missing_base > 0 {
            match fill_leg(ctx, cancel, &intent_id, market, side, missing_base).await {
                Ok(fix) => {
                    let notional = fix.notional_quote(config.base_decimals);
                    match market {
                        MarketKind::Spot => {
                            spot_notional += notional;
                            spot_filled += fix.filled_base;
                        }
                        MarketKind::Perp => {
                            perp_notional += notional;
                            perp_filled += fix.filled_base;
                        }
                    }
                }
                Err(leg) if leg.cancelled => return Err(JobError::Cancelled),
                Err(leg) => {
                    // The hedge is on, just lopsided; count what the
                    // correction did fill, flag the rest and keep going.
                    let notional = leg.filled.notional_quote(config.base_decimals);
                    match market {
                        MarketKind::Spot => {
                            spot_notional += notional;
                            spot_filled += leg.filled.filled_base;
                        }
                        MarketKind::Perp => {
                            perp_notional += notional;
                            perp_filled += leg.filled.filled_base;
                        }
                    }
                    ctx.audit.alert(
                        AlertSeverity::Warning,
                        "DRIFT_CORRECTION_FAILED",
                        json!({ "intentId": intent_id, "driftBps": drift, "error": leg.reason }),
                    );
                }
            }
        }
    }

    hedge_transition(
        ctx,
        HedgeState::Active {
            notional_quote: perp_notional,
            spot_qty_base: spot_filled,
            perp_qty_base: perp_filled,
        },
        "SPOT_FILLED",
        &intent_id,
    )
    .await?;

    info!(
        intent_id = %intent_id,
        notional_quote = perp_notional,
        spot_base = spot_filled,
        perp_base = perp_filled,
        "hedge entered"
    );
    Ok(ExecutionOutcome::Entered {
        intent_id,
        notional_quote: perp_notional,
        spot_qty_base: spot_filled,
        perp_qty_base: perp_filled,
    })
}

// ─────────────────────────────────────────────────────────
// EXIT_HEDGE
// ─────────────────────────────────────────────────────────

async fn run_exit(
    ctx: &JobCtx,
    cancel: &CancelSignal,
    intent: ExitHedgeIntent,
) -> Result<ExecutionOutcome, JobError> {
    let config = &ctx.config;
    let intent_id = intent.intent_id.clone();

    let (spot_qty_base, perp_qty_base) = {
        let hedge = ctx.hedge.lock().await;
        match hedge.state() {
            HedgeState::Active { spot_qty_base, perp_qty_base, .. } => {
                (*spot_qty_base, *perp_qty_base)
            }
            _ => {
                return Ok(ExecutionOutcome::Aborted {
                    intent_id,
                    reason: AbortReason::NoActiveHedge,
                });
            }
        }
    };

    // Risk re-check is informational on exit: flattening proceeds even when
    // the assessment says EXIT or BLOCK, recorded with the exit reason.
    let state = ctx.store.snapshot().await;
    let metrics = *ctx.metrics.lock().await;
    let assessment = risk::evaluate(
        &build_risk_snapshot(
            &state,
            &metrics,
            &config.perp_symbol,
            &config.quote_asset,
            config.base_decimals,
        ),
        &config.risk,
    );
    info!(
        intent_id = %intent_id,
        reason = %intent.reason,
        risk_action = ?assessment.action,
        "exiting hedge"
    );
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }

    hedge_transition(ctx, HedgeState::ExitingSpot, &intent.reason, &intent_id).await?;
    let spot = fill_leg(ctx, cancel, &intent_id, MarketKind::Spot, OrderSide::Sell, spot_qty_base)
        .await
        .map_err(LegError::into_job_error)?;

    hedge_transition(ctx, HedgeState::ExitingPerp, "SPOT_CLOSED", &intent_id).await?;
    let perp = fill_leg(ctx, cancel, &intent_id, MarketKind::Perp, OrderSide::Buy, perp_qty_base)
        .await
        .map_err(LegError::into_job_error)?;

    // Flat confirmation on both legs, within dust tolerance.
    let tolerance_base = (perp_qty_base * 10 / BPS_SCALE).max(1);
    let position = ctx
        .policy
        .execute(Namespace::Account, 1, || ctx.adapter.get_position(&config.perp_symbol))
        .await
        .map_err(|e| JobError::Failed(format!("flat check: {e}")))?;
    let perp_residual = position.map(|p| p.size_base).unwrap_or(0);
    let balance = ctx
        .policy
        .execute(Namespace::Account, 1, || ctx.adapter.get_balance(&config.base_asset))
        .await
        .map_err(|e| JobError::Failed(format!("flat check: {e}")))?;
    let spot_residual = balance.total_base;

    if perp_residual.abs() > tolerance_base || spot_residual.abs() > tolerance_base {
        // Keep the hedge state as-is; the operator must see this.
        ctx.audit.alert(
            AlertSeverity::Critical,
            "NOT_FLAT_AFTER_EXIT",
            json!({
                "intentId": intent_id,
                "perpResidualBase": perp_residual,
                "spotResidualBase": spot_residual,
                "toleranceBase": tolerance_base,
            }),
        );
        return Err(JobError::Failed("position not flat after exit".into()));
    }

    let pnl_quote =
        spot.notional_quote(config.base_decimals) - perp.notional_quote(config.base_decimals);
    hedge_transition(ctx, HedgeState::Closed { pnl_quote }, "PERP_CLOSED", &intent_id).await?;

    {
        let mut metrics = ctx.metrics.lock().await;
        metrics.daily_pnl_quote += pnl_quote;
    }

    info!(intent_id = %intent_id, pnl_quote, "hedge exited flat");
    Ok(ExecutionOutcome::Exited { intent_id, pnl_quote })
}

// ─────────────────────────────────────────────────────────
// Leg filling
// ─────────────────────────────────────────────────────────

/// Fill `qty_base` on one leg with market orders, completing partials up to
/// the retry cap. On failure the error reports everything that did fill.
async fn fill_leg(
    ctx: &JobCtx,
    cancel: &CancelSignal,
    intent_id: &str,
    market: MarketKind,
    side: OrderSide,
    qty_base: Amount,
) -> Result<LegFill, LegError> {
    let config = &ctx.config;
    let symbol = match market {
        MarketKind::Perp => &config.perp_symbol,
        MarketKind::Spot => &config.spot_symbol,
    };

    let mut remaining_base = qty_base;
    let mut filled_base: Amount = 0;
    let mut weighted_quote: Amount = 0;
    let mut retries: u32 = 0;

    let leg_fill = |filled_base: Amount, weighted_quote: Amount| LegFill {
        filled_base,
        avg_price_quote: if filled_base > 0 { weighted_quote / filled_base } else { 0 },
    };

    loop {
        if cancel.is_cancelled() {
            return Err(LegError {
                filled: leg_fill(filled_base, weighted_quote),
                cancelled: true,
                reason: "job cancelled".into(),
            });
        }

        let order = match place_and_settle(ctx, cancel, intent_id, symbol, market, side, remaining_base)
            .await
        {
            Ok(order) => order,
            Err(JobError::Cancelled) => {
                return Err(LegError {
                    filled: leg_fill(filled_base, weighted_quote),
                    cancelled: true,
                    reason: "job cancelled".into(),
                });
            }
            Err(JobError::Failed(reason)) => {
                return Err(LegError {
                    filled: leg_fill(filled_base, weighted_quote),
                    cancelled: false,
                    reason,
                });
            }
        };
        if order.filled_quantity_base > 0 {
            let avg = order.avg_fill_price_quote.unwrap_or(0);
            weighted_quote += order.filled_quantity_base * avg;
            filled_base += order.filled_quantity_base;
            remaining_base -= order.filled_quantity_base;
        }

        if remaining_base <= 0 {
            return Ok(leg_fill(filled_base, weighted_quote));
        }

        if order.filled_quantity_base == 0 && filled_base == 0 {
            // Terminal without any fill: the leg failed outright.
            return Err(LegError {
                filled: leg_fill(0, 0),
                cancelled: false,
                reason: format!(
                    "{market:?} {side:?} leg terminal without fill ({:?})",
                    order.status
                ),
            });
        }

        retries += 1;
        if retries > config.execution.max_partial_fill_retries {
            ctx.audit.alert(
                AlertSeverity::Warning,
                "PARTIAL_FILL_RETRIES_EXHAUSTED",
                json!({
                    "intentId": intent_id,
                    "market": format!("{market:?}"),
                    "remainingBase": remaining_base,
                }),
            );
            return Err(LegError {
                filled: leg_fill(filled_base, weighted_quote),
                cancelled: false,
                reason: format!(
                    "partial fill retries exhausted, {remaining_base} base remaining"
                ),
            });
        }
        info!(
            intent_id = %intent_id,
            ?market,
            remaining_base,
            retry = retries,
            "completing partial fill"
        );
    }
}

/// Place one market order and poll it to a terminal status, driving the
/// managed-order machine and the audit log along the way.
async fn place_and_settle(
    ctx: &JobCtx,
    cancel: &CancelSignal,
    intent_id: &str,
    symbol: &str,
    market: MarketKind,
    side: OrderSide,
    qty_base: Amount,
) -> Result<ManagedOrder, JobError> {
    let config = &ctx.config;
    let mut managed = ManagedOrder::new(
        intent_id,
        symbol,
        market,
        side,
        OrderType::Market,
        qty_base,
        None,
    );
    ctx.store.upsert_order(managed.clone()).await;
    advance_order(ctx, &mut managed, OrderEvent::Submit).await?;

    let request = OrderRequest {
        symbol: symbol.to_string(),
        market,
        side,
        order_type: OrderType::Market,
        quantity_base: qty_base,
        price_quote: None,
        time_in_force: None,
    };

    let ack_timeout = Duration::from_millis(config.execution.order_ack_timeout_ms);
    let placed = tokio::time::timeout(
        ack_timeout,
        ctx.policy.execute(Namespace::Orders, 1, || ctx.adapter.create_order(request.clone())),
    )
    .await;

    let exchange_order = match placed {
        Ok(Ok(order)) => order,
        Ok(Err(err)) => {
            advance_order(ctx, &mut managed, OrderEvent::Reject { error: err.to_string() }).await?;
            return match err {
                ExchangeError::Validation(_) | ExchangeError::Business(_) => {
                    Err(JobError::Failed(format!("order rejected: {err}")))
                }
                other => Err(JobError::Failed(format!("order placement: {other}"))),
            };
        }
        Err(_) => {
            // Ack deadline passed with nothing filled; the canceled record
            // flows back so the leg can decide whether to retry.
            advance_order(ctx, &mut managed, OrderEvent::Timeout { reason: "ack deadline".into() })
                .await?;
            return Ok(managed);
        }
    };

    advance_order(
        ctx,
        &mut managed,
        OrderEvent::Ack { exchange_order_id: exchange_order.exchange_order_id.clone() },
    )
    .await?;

    // The venue may have settled the order synchronously.
    if exchange_order.status.is_terminal() {
        settle_from_report(ctx, &mut managed, &exchange_order).await?;
        return Ok(managed);
    }

    // Poll with bounded exponential retry inside the fill deadline.
    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(config.execution.order_fill_timeout_ms);
    let mut poll_delay = Duration::from_millis(200);
    let exchange_id = exchange_order.exchange_order_id.clone();

    loop {
        if cancel.is_cancelled() {
            let _ = ctx.adapter.cancel_order(&exchange_id).await;
            advance_order(ctx, &mut managed, OrderEvent::Cancel { reason: "job cancelled".into() })
                .await?;
            return Err(JobError::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            // Cancel on the venue and surface the canceled record with its
            // partial fills; the leg treats zero-fill as outright failure.
            let _ = ctx.adapter.cancel_order(&exchange_id).await;
            advance_order(ctx, &mut managed, OrderEvent::Timeout { reason: "fill deadline".into() })
                .await?;
            return Ok(managed);
        }

        let report = ctx
            .policy
            .execute(Namespace::Orders, 1, || ctx.adapter.get_order(&exchange_id))
            .await
            .map_err(|e| JobError::Failed(format!("order poll: {e}")))?;

        if report.status.is_terminal() {
            settle_from_report(ctx, &mut managed, &report).await?;
            return Ok(managed);
        }
        if report.filled_quantity_base > managed.filled_quantity_base {
            let delta = report.filled_quantity_base - managed.filled_quantity_base;
            advance_order(
                ctx,
                &mut managed,
                OrderEvent::PartialFill {
                    filled_qty_base: delta,
                    avg_price_quote: report.avg_fill_price_quote.unwrap_or(0),
                },
            )
            .await?;
        }

        tokio::time::sleep(poll_delay).await;
        poll_delay = (poll_delay * 2).min(Duration::from_secs(2));
    }
}

/// Map a terminal exchange report onto the managed order.
async fn settle_from_report(
    ctx: &JobCtx,
    managed: &mut ManagedOrder,
    report: &ExchangeOrder,
) -> Result<(), JobError> {
    let avg = report.avg_fill_price_quote.unwrap_or(0);
    match report.status {
        ExchangeOrderStatus::Filled => {
            let delta = report.filled_quantity_base - managed.filled_quantity_base;
            advance_order(
                ctx,
                managed,
                OrderEvent::Fill { filled_qty_base: delta, avg_price_quote: avg },
            )
            .await
        }
        ExchangeOrderStatus::Canceled => {
            if report.filled_quantity_base > managed.filled_quantity_base {
                let delta = report.filled_quantity_base - managed.filled_quantity_base;
                advance_order(
                    ctx,
                    managed,
                    OrderEvent::PartialFill { filled_qty_base: delta, avg_price_quote: avg },
                )
                .await?;
            }
            advance_order(ctx, managed, OrderEvent::Cancel { reason: "venue canceled".into() }).await
        }
        ExchangeOrderStatus::Rejected => {
            advance_order(ctx, managed, OrderEvent::Reject { error: "venue rejected".into() }).await
        }
        ExchangeOrderStatus::New | ExchangeOrderStatus::PartiallyFilled => Ok(()),
    }
}

/// Apply an order event, audit it, and mirror the record into the store.
async fn advance_order(
    ctx: &JobCtx,
    managed: &mut ManagedOrder,
    event: OrderEvent,
) -> Result<(), JobError> {
    let next = managed
        .apply(&event)
        .map_err(|e| JobError::Failed(format!("order state machine: {e}")))?;
    ctx.audit.order_transition(
        &next.id,
        managed.status.as_str(),
        next.status.as_str(),
        event.name(),
        &next.intent_id,
    );
    if next.status.is_terminal() {
        // Terminal orders leave the open set; they live on in the audit log.
        ctx.store.remove_order(&next.id).await;
    } else {
        ctx.store.upsert_order(next.clone()).await;
    }
    *managed = next;
    Ok(())
}

async fn hedge_transition(
    ctx: &JobCtx,
    next: HedgeState,
    event: &str,
    correlation_id: &str,
) -> Result<(), JobError> {
    let mut hedge = ctx.hedge.lock().await;
    let (from, to) = hedge
        .transition_to(next)
        .map_err(|e| JobError::Failed(format!("hedge state machine: {e}")))?;
    ctx.audit.hedge_transition(from, to, event, correlation_id);
    Ok(())
}

/// Best-effort unwind of a half-built hedge: sell back any partial spot,
/// buy back the perp short. Single market orders; residual exposure is the
/// reconciler's problem and the operator's alert.
async fn unwind_entry(ctx: &JobCtx, intent_id: &str, perp: LegFill, spot_filled_base: Amount) {
    warn!(
        intent_id = %intent_id,
        perp_base = perp.filled_base,
        spot_base = spot_filled_base,
        "unwinding partial hedge entry"
    );
    if hedge_transition(ctx, HedgeState::ExitingPerp, "ENTRY_UNWIND", intent_id).await.is_err() {
        return;
    }

    let mut failed = false;
    if spot_filled_base > 0 {
        let request = OrderRequest {
            symbol: ctx.config.spot_symbol.clone(),
            market: MarketKind::Spot,
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            quantity_base: spot_filled_base,
            price_quote: None,
            time_in_force: None,
        };
        if let Err(err) = ctx
            .policy
            .execute(Namespace::Orders, 1, || ctx.adapter.create_order(request.clone()))
            .await
        {
            failed = true;
            ctx.audit.alert(
                AlertSeverity::Critical,
                "UNWIND_FAILED",
                json!({ "intentId": intent_id, "leg": "spot", "base": spot_filled_base, "error": err.to_string() }),
            );
        }
    }

    let request = OrderRequest {
        symbol: ctx.config.perp_symbol.clone(),
        market: MarketKind::Perp,
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        quantity_base: perp.filled_base,
        price_quote: None,
        time_in_force: None,
    };
    match ctx
        .policy
        .execute(Namespace::Orders, 1, || ctx.adapter.create_order(request.clone()))
        .await
    {
        Ok(_) if !failed => {
            let _ = hedge_transition(ctx, HedgeState::Closed { pnl_quote: 0 }, "UNWOUND", intent_id)
                .await;
        }
        Ok(_) => {}
        Err(err) => {
            ctx.audit.alert(
                AlertSeverity::Critical,
                "UNWIND_FAILED",
                json!({ "intentId": intent_id, "leg": "perp", "base": perp.filled_base, "error": err.to_string() }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::adapter::paper::{FillBehavior, PaperExchange};
    use crate::config::CircuitConfig;
    use crate::lifecycle::audit::{AuditKind, MemoryAuditSink};
    use crate::types::{Balance, BookLevel, OrderBook, Position, Side, Ticker};

    struct Rig {
        exchange: Arc<PaperExchange>,
        engine: ExecutionEngine,
        sink: Arc<MemoryAuditSink>,
        store: Arc<StateStore>,
    }

    fn config() -> BotConfig {
        BotConfig::default()
    }

    fn rig_with(config: BotConfig) -> Rig {
        let exchange = PaperExchange::new("BTC", "USDT", 8);
        exchange.set_order_book(OrderBook {
            symbol: "BTCUSDT".into(),
            bids: (0..5)
                .map(|i| BookLevel {
                    price_quote: 49_995_000_000 - i * 5_000_000,
                    qty_base: 10_000_000_000,
                })
                .collect(),
            asks: (0..5)
                .map(|i| BookLevel {
                    price_quote: 50_005_000_000 + i * 5_000_000,
                    qty_base: 10_000_000_000,
                })
                .collect(),
            timestamp: Utc::now(),
        });
        exchange.set_ticker(Ticker {
            symbol: "BTCUSDT".into(),
            bid_quote: 49_995_000_000,
            ask_quote: 50_005_000_000,
            last_quote: 50_000_000_000,
            volume_base: 0,
            timestamp: Utc::now(),
        });
        exchange.set_balance(Balance::new("USDT", 100_000_000_000, 0));

        let store = Arc::new(StateStore::new());
        let sink = Arc::new(MemoryAuditSink::new());
        let audit = AuditLog::new(sink.clone());
        let policy = Arc::new(RequestPolicy::new(
            &config.rate_limit,
            CircuitBreaker::new("request", config.request_circuit.clone()),
        ));
        let circuit = Arc::new(CircuitBreaker::new("execution", config.execution_circuit.clone()));
        let engine = ExecutionEngine::new(
            exchange.clone(),
            policy,
            store.clone(),
            audit,
            circuit,
            Arc::new(config),
        );
        Rig { exchange, engine, sink, store }
    }

    fn rig() -> Rig {
        rig_with(config())
    }

    fn enter_intent(size_quote: Amount) -> EnterHedgeIntent {
        EnterHedgeIntent { intent_id: "intent-enter".into(), size_quote }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_happy_path() {
        let rig = rig();
        let outcome = rig
            .engine
            .submit_enter(enter_intent(1_000_000_000)) // $1k at 6dp quote
            .wait()
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Entered { spot_qty_base, perp_qty_base, notional_quote, .. } => {
                assert!(spot_qty_base > 0);
                assert_eq!(spot_qty_base, perp_qty_base);
                assert!(notional_quote > 0);
            }
            other => panic!("expected Entered, got {other:?}"),
        }

        // Short perp on the venue, spot in the wallet, hedge active.
        let position = rig.exchange.get_position("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(position.side, Side::Short);
        assert!(matches!(rig.engine.hedge_state().await, HedgeState::Active { .. }));

        // Both legs produced audited lifecycle transitions.
        let transitions = rig.sink.of_kind(AuditKind::OrderTransition);
        assert!(transitions.len() >= 6); // submit/ack/fill per leg
        let hedge = rig.sink.of_kind(AuditKind::HedgeTransition);
        assert_eq!(hedge.len(), 3); // idle→entering_perp→entering_spot→active
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_aborts_when_circuit_open() {
        let rig = rig();
        // Two failures open the execution breaker (default config).
        for _ in 0..2 {
            rig.exchange.push_fill_behavior(FillBehavior::Reject { reason: "margin".into() });
            let result = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await;
            assert!(matches!(result, Err(JobError::Failed(_))));
        }
        assert_eq!(rig.engine.circuit_state(), CircuitState::Open);

        let outcome = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Aborted {
                intent_id: "intent-enter".into(),
                reason: AbortReason::ExecutionCircuitBreakerOpen,
            }
        );
        let alerts = rig.sink.of_kind(AuditKind::Alert);
        assert!(alerts
            .iter()
            .any(|a| a.payload["code"] == "EXECUTION_CIRCUIT_BREAKER_OPEN"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_aborts_on_second_phase_risk() {
        let rig = rig();
        // An oversized position lands in the store between decision and
        // execution; the two-phase check must veto.
        rig.store
            .update_positions(vec![Position {
                symbol: "BTCUSDT".into(),
                side: Side::Short,
                size_base: 100_000_000,
                entry_price_quote: 50_000_000_000,
                mark_price_quote: 50_000_000_000,
                liquidation_price_quote: Some(65_000_000_000),
                unrealized_pnl_quote: -600_000_000,
                leverage_bps: 50_000, // 5x breaches the 3x cap
                margin_quote: 5_000_000_000,
            }])
            .await;

        let outcome = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Aborted { reason: AbortReason::RiskRejected { action: RiskAction::Block }, .. }
        ));
        // No orders hit the venue.
        assert_eq!(rig.exchange.order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_aborts_on_thin_book() {
        let rig = rig();
        rig.exchange.set_order_book(OrderBook {
            symbol: "BTCUSDT".into(),
            bids: vec![BookLevel { price_quote: 49_995_000_000, qty_base: 100_000 }],
            asks: vec![BookLevel { price_quote: 50_005_000_000, qty_base: 100_000 }],
            timestamp: Utc::now(),
        });
        let outcome = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Aborted { reason: AbortReason::InsufficientLiquidity, .. }
        ));
        assert_eq!(rig.exchange.order_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_fill_completion() {
        let rig = rig();
        // Perp leg: a terminal partial, then the completion order fills.
        rig.exchange.push_fill_behavior(FillBehavior::Partial { filled_base: 1_000_000 });
        let outcome = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        match outcome {
            ExecutionOutcome::Entered { perp_qty_base, spot_qty_base, .. } => {
                assert_eq!(perp_qty_base, spot_qty_base);
            }
            other => panic!("expected Entered, got {other:?}"),
        }
        // Three orders: partial perp, completion perp, spot.
        assert_eq!(rig.exchange.order_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_fill_retries_exhaust() {
        let mut config = config();
        config.execution.max_partial_fill_retries = 2;
        let rig = rig_with(config);
        for _ in 0..4 {
            rig.exchange.push_fill_behavior(FillBehavior::Partial { filled_base: 1_000 });
        }
        let result = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await;
        assert!(matches!(result, Err(JobError::Failed(_))));
        let alerts = rig.sink.of_kind(AuditKind::Alert);
        assert!(alerts
            .iter()
            .any(|a| a.payload["code"] == "PARTIAL_FILL_RETRIES_EXHAUSTED"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spot_failure_unwinds_naked_perp() {
        let rig = rig();
        // Perp fills, spot leg rejects outright (zero fill, no retries).
        rig.exchange.push_fill_behavior(FillBehavior::Fill);
        rig.exchange.push_fill_behavior(FillBehavior::Reject { reason: "balance".into() });
        let result = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await;
        assert!(matches!(result, Err(JobError::Failed(_))));
        // The unwind buy closed the short.
        assert!(rig.exchange.get_position("BTCUSDT").await.unwrap().is_none());
        assert!(matches!(rig.engine.hedge_state().await, HedgeState::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_perp_leg_failure_unwinds_exposure() {
        let rig = rig();
        // Perp leg: a partial, then the completion order is rejected.
        rig.exchange.push_fill_behavior(FillBehavior::Partial { filled_base: 1_000_000 });
        rig.exchange.push_fill_behavior(FillBehavior::Reject { reason: "margin".into() });

        let result = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await;
        assert!(matches!(result, Err(JobError::Failed(_))));

        // The partial short was bought back, not forgotten.
        assert!(rig.exchange.get_position("BTCUSDT").await.unwrap().is_none());
        assert!(matches!(rig.engine.hedge_state().await, HedgeState::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_happy_path() {
        let rig = rig();
        rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();

        let outcome = rig
            .engine
            .submit_exit(ExitHedgeIntent {
                intent_id: "intent-exit".into(),
                reason: "target_yield_reached".into(),
            })
            .wait()
            .await
            .unwrap();
        match outcome {
            ExecutionOutcome::Exited { intent_id, .. } => assert_eq!(intent_id, "intent-exit"),
            other => panic!("expected Exited, got {other:?}"),
        }
        assert!(rig.exchange.get_position("BTCUSDT").await.unwrap().is_none());
        assert!(matches!(rig.engine.hedge_state().await, HedgeState::Closed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_without_hedge_aborts() {
        let rig = rig();
        let outcome = rig
            .engine
            .submit_exit(ExitHedgeIntent { intent_id: "i".into(), reason: "r".into() })
            .wait()
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Aborted { reason: AbortReason::NoActiveHedge, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_flat_after_exit_is_critical() {
        let rig = rig();
        rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();

        // Simulate drift the engine does not know about: the venue reports
        // a bigger short than the hedge carries.
        let mut position = rig.exchange.get_position("BTCUSDT").await.unwrap().unwrap();
        position.size_base += 50_000_000;
        rig.exchange.set_position(position);

        let result = rig
            .engine
            .submit_exit(ExitHedgeIntent { intent_id: "intent-exit".into(), reason: "risk_exit".into() })
            .wait()
            .await;
        assert!(matches!(result, Err(JobError::Failed(_))));

        let alerts = rig.sink.of_kind(AuditKind::Alert);
        assert!(alerts.iter().any(|a| a.payload["code"] == "NOT_FLAT_AFTER_EXIT"));
        // Position state is not cleared.
        assert!(rig.exchange.get_position("BTCUSDT").await.unwrap().is_some());
        assert!(matches!(rig.engine.hedge_state().await, HedgeState::ExitingPerp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_entry_aborts() {
        let rig = rig();
        rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        let outcome = rig.engine.submit_enter(enter_intent(1_000_000_000)).wait().await.unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Aborted { reason: AbortReason::HedgeAlreadyActive, .. }
        ));
    }
}
