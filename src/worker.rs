//! Worker: the decision loop.
//!
//! Wires the data plane, reconciler, risk evaluator, strategy and execution
//! engine together. A timer drives the evaluation tick (missed ticks are
//! skipped, never queued); each tick checks health through the position-aware
//! stale-data policy, reconciles on its own cadence, evaluates risk, asks
//! the strategy for an intent, and hands intents to the serial execution
//! queue. Shutdown drains in-flight work before stopping the data plane.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::ExchangeAdapter;
use crate::config::BotConfig;
use crate::data_plane::DataPlane;
use crate::execution::engine::{
    build_risk_snapshot, EnterHedgeIntent, ExecutionEngine, ExitHedgeIntent,
};
use crate::lifecycle::audit::{AlertSeverity, AuditLog, AuditSink};
use crate::policy::circuit::CircuitBreaker;
use crate::policy::RequestPolicy;
use crate::reconcile::Reconciler;
use crate::risk::{self, margin_utilization_bps};
use crate::state::{is_state_fresh, StateStore};
use crate::strategy::{self, Decision, FundingWindow, StrategyInputs};
use crate::types::BPS_SCALE;

// ─────────────────────────────────────────────────────────
// Stale-data response policy (position-aware)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedAction {
    Continue,
    PauseEntries,
    PauseAndWait,
    ForceExit,
    ReduceRisk,
    EmergencyExit,
    FullPause,
}

/// How long stale websocket data is tolerated with an open position.
const STALE_OPEN_GRACE_MS: u128 = 30_000;
/// Margin buffer below which a REST outage forces an exit.
const MIN_MARGIN_BUFFER_BPS: i128 = 500;

/// Decision table over websocket health, REST health and position state.
pub fn degraded_action(
    ws_healthy: bool,
    rest_healthy: bool,
    position_open: bool,
    stale_age_ms: u128,
    margin_buffer_bps: i128,
) -> DegradedAction {
    match (ws_healthy, rest_healthy, position_open) {
        (true, true, _) => DegradedAction::Continue,
        (false, true, false) => DegradedAction::PauseEntries,
        (false, true, true) => {
            if stale_age_ms < STALE_OPEN_GRACE_MS {
                DegradedAction::PauseAndWait
            } else {
                DegradedAction::ForceExit
            }
        }
        (true, false, false) => DegradedAction::PauseEntries,
        (true, false, true) => {
            if margin_buffer_bps >= MIN_MARGIN_BUFFER_BPS {
                DegradedAction::ReduceRisk
            } else {
                DegradedAction::ForceExit
            }
        }
        (false, false, true) => DegradedAction::EmergencyExit,
        (false, false, false) => DegradedAction::FullPause,
    }
}

// ─────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TickState {
    /// Funding timestamp last credited to realized yield.
    last_funding_credited: Option<DateTime<Utc>>,
    realized_yield_bps: i128,
    last_reconcile: Option<Instant>,
    /// When required streams first went stale, for the grace window.
    ws_stale_since: Option<Instant>,
}

pub struct Worker {
    config: Arc<BotConfig>,
    store: Arc<StateStore>,
    data_plane: Arc<DataPlane>,
    engine: Arc<ExecutionEngine>,
    reconciler: Reconciler,
    audit: AuditLog,
    funding_window: Mutex<FundingWindow>,
    tick_state: Mutex<TickState>,
}

impl Worker {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        config: Arc<BotConfig>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let audit = AuditLog::new(audit_sink);
        let store = Arc::new(StateStore::new());
        let policy = Arc::new(RequestPolicy::new(
            &config.rate_limit,
            CircuitBreaker::new("request", config.request_circuit.clone()),
        ));
        let data_plane = DataPlane::new(
            adapter.clone(),
            policy.clone(),
            store.clone(),
            audit.clone(),
            config.clone(),
        );
        let engine = Arc::new(ExecutionEngine::new(
            adapter.clone(),
            policy.clone(),
            store.clone(),
            audit.clone(),
            Arc::new(CircuitBreaker::new("execution", config.execution_circuit.clone())),
            config.clone(),
        ));
        let reconciler = Reconciler::new(
            adapter,
            policy,
            store.clone(),
            audit.clone(),
            config.reconcile.clone(),
            config.perp_symbol.clone(),
            config.base_asset.clone(),
            config.base_decimals,
        );
        let trend_window = config.strategy.trend_window;

        Arc::new(Self {
            config,
            store,
            data_plane,
            engine,
            reconciler,
            audit,
            funding_window: Mutex::new(FundingWindow::new(trend_window)),
            tick_state: Mutex::new(TickState::default()),
        })
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    /// Run until `shutdown` flips. Startup errors (connect, first
    /// reconcile) propagate; after that the loop only stops on shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.data_plane
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("data plane startup: {e}"))?;
        self.reconciler
            .run_once()
            .await
            .map_err(|e| anyhow::anyhow!("initial reconcile: {e}"))?;
        {
            let mut tick_state = self.tick_state.lock().await;
            tick_state.last_reconcile = Some(Instant::now());
        }
        info!("worker running");

        let mut ticker = tokio::time::interval(self.config.eval_tick());
        // A tick firing while the previous one runs is skipped, not queued.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.evaluation_tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("worker shutting down");
        self.engine.cancel_all();
        self.engine.wait_for_idle().await;
        self.data_plane.stop().await;
        Ok(())
    }

    async fn evaluation_tick(&self) {
        let snapshot = self.store.snapshot().await;
        let health = self.data_plane.health();

        // Periodic reconcile rides the evaluation tick.
        let reconcile_due = {
            let tick_state = self.tick_state.lock().await;
            match tick_state.last_reconcile {
                Some(last) => {
                    last.elapsed() >= Duration::from_millis(self.config.timing.reconcile_ms)
                }
                None => true,
            }
        };
        let mut critical_drift = false;
        if reconcile_due {
            match self.reconciler.run_once().await {
                Ok(report) => {
                    if report.has_critical() {
                        critical_drift = true;
                        self.audit.alert(
                            AlertSeverity::Critical,
                            "RECONCILE_CRITICAL_DRIFT",
                            json!({
                                "positionInconsistencies": report.position_inconsistencies.len(),
                                "balanceInconsistencies": report.balance_inconsistencies.len(),
                            }),
                        );
                    }
                }
                Err(err) => warn!(error = %err, "reconcile failed"),
            }
            let mut tick_state = self.tick_state.lock().await;
            tick_state.last_reconcile = Some(Instant::now());
        }

        // Health gates.
        let fresh = is_state_fresh(&snapshot, &self.config.freshness);
        let ws_healthy = snapshot.ws_connected && health.required_streams_healthy() && fresh;
        let rest_healthy = health.rest_healthy();
        let holding = self.engine.hedge_engaged().await;

        let stale_age_ms = {
            let mut tick_state = self.tick_state.lock().await;
            if ws_healthy {
                tick_state.ws_stale_since = None;
                0
            } else {
                let since = *tick_state.ws_stale_since.get_or_insert_with(Instant::now);
                since.elapsed().as_millis()
            }
        };

        let metrics_arc = self.engine.metrics();
        let metrics = *metrics_arc.lock().await;
        let risk_snapshot = build_risk_snapshot(
            &snapshot,
            &metrics,
            &self.config.perp_symbol,
            &self.config.quote_asset,
            self.config.base_decimals,
        );
        let margin_buffer_bps =
            BPS_SCALE - margin_utilization_bps(risk_snapshot.margin_used_quote, risk_snapshot.equity_quote);

        let action = degraded_action(ws_healthy, rest_healthy, holding, stale_age_ms, margin_buffer_bps);
        match action {
            DegradedAction::Continue => {}
            DegradedAction::ForceExit | DegradedAction::EmergencyExit => {
                warn!(?action, "degraded data, flattening position");
                self.audit.alert(
                    AlertSeverity::Critical,
                    "STALE_DATA_FORCED_EXIT",
                    json!({ "action": format!("{action:?}"), "staleAgeMs": stale_age_ms as u64 }),
                );
                if holding && !self.engine.is_busy() {
                    let intent = ExitHedgeIntent {
                        intent_id: Uuid::new_v4().to_string(),
                        reason: "stale_data_forced_exit".into(),
                    };
                    self.spawn_outcome_logger(self.engine.submit_exit(intent));
                }
                return;
            }
            DegradedAction::PauseEntries
            | DegradedAction::PauseAndWait
            | DegradedAction::ReduceRisk
            | DegradedAction::FullPause => {
                debug!(?action, "degraded data, entries paused");
                return;
            }
        }

        // Peak equity ratchets up with every healthy look at the account.
        {
            let mut metrics = metrics_arc.lock().await;
            metrics.peak_equity_quote = metrics.peak_equity_quote.max(risk_snapshot.equity_quote);
        }

        // Funding window + realized yield.
        let (trend, current_rate_bps, realized_yield_bps) = {
            let mut window = self.funding_window.lock().await;
            let mut tick_state = self.tick_state.lock().await;
            let mut current = 0;
            if let Some(funding) = &snapshot.funding_rate {
                current = funding.rate_bps;
                window.push(funding.rate_bps);
                // One funding interval accrues once per fresh snapshot.
                if holding && tick_state.last_funding_credited != Some(funding.timestamp) {
                    if tick_state.last_funding_credited.is_some() {
                        tick_state.realized_yield_bps += funding.rate_bps;
                    }
                    tick_state.last_funding_credited = Some(funding.timestamp);
                }
                if !holding {
                    tick_state.realized_yield_bps = 0;
                    tick_state.last_funding_credited = Some(funding.timestamp);
                }
            }
            (window.analyze(), current, tick_state.realized_yield_bps)
        };

        let assessment = risk::evaluate(&risk_snapshot, &self.config.risk);

        // One intent in flight at a time; the serial queue is the only
        // writer to the exchange.
        if self.engine.is_busy() {
            debug!("execution queue busy, skipping decision");
            return;
        }
        if critical_drift && !holding {
            debug!("critical drift this tick, entries paused");
            return;
        }

        let decision = strategy::decide(
            &StrategyInputs {
                current_rate_bps,
                trend: trend.as_ref(),
                holding,
                realized_yield_bps,
                risk: &assessment,
            },
            &self.config.strategy,
        );

        match decision {
            Decision::Noop => {}
            Decision::EnterHedge { size_quote, confidence } => {
                let intent_id = Uuid::new_v4().to_string();
                info!(
                    %intent_id,
                    size_quote,
                    ?confidence,
                    rate_bps = current_rate_bps,
                    "strategy entry signal"
                );
                self.spawn_outcome_logger(
                    self.engine.submit_enter(EnterHedgeIntent { intent_id, size_quote }),
                );
            }
            Decision::ExitHedge { reason } => {
                let intent_id = Uuid::new_v4().to_string();
                info!(%intent_id, reason = reason.as_str(), "strategy exit signal");
                self.spawn_outcome_logger(self.engine.submit_exit(ExitHedgeIntent {
                    intent_id,
                    reason: reason.as_str().to_string(),
                }));
            }
        }
    }

    fn spawn_outcome_logger(
        &self,
        handle: crate::execution::queue::JobHandle<crate::execution::engine::ExecutionOutcome>,
    ) {
        tokio::spawn(async move {
            match handle.wait().await {
                Ok(outcome) => info!(?outcome, "execution job finished"),
                Err(err) => warn!(error = %err, "execution job failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::adapter::paper::PaperExchange;
    use crate::lifecycle::audit::MemoryAuditSink;
    use crate::lifecycle::hedge::HedgeState;
    use crate::types::{Balance, BookLevel, FundingRate, OrderBook, Ticker};

    // ── Stale-data table ──

    #[test]
    fn test_degraded_action_table() {
        use DegradedAction::*;
        // ws, rest, open, age, buffer → expected
        let rows = [
            (true, true, false, 0, 9_000, Continue),
            (true, true, true, 0, 9_000, Continue),
            (false, true, false, 0, 9_000, PauseEntries),
            (false, true, true, 10_000, 9_000, PauseAndWait),
            (false, true, true, 30_000, 9_000, ForceExit),
            (true, false, false, 0, 9_000, PauseEntries),
            (true, false, true, 0, 600, ReduceRisk),
            (true, false, true, 0, 400, ForceExit),
            (false, false, true, 60_000, 100, EmergencyExit),
            (false, false, false, 60_000, 9_000, FullPause),
        ];
        for (ws, rest, open, age, buffer, expected) in rows {
            assert_eq!(
                degraded_action(ws, rest, open, age, buffer),
                expected,
                "ws={ws} rest={rest} open={open} age={age} buffer={buffer}"
            );
        }
    }

    // ── End-to-end dry run ──

    fn seeded_exchange() -> Arc<PaperExchange> {
        let exchange = PaperExchange::new("BTC", "USDT", 8);
        exchange.set_ticker(Ticker {
            symbol: "BTCUSDT".into(),
            bid_quote: 49_995_000_000,
            ask_quote: 50_005_000_000,
            last_quote: 50_000_000_000,
            volume_base: 0,
            timestamp: Utc::now(),
        });
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
        exchange.set_funding_rate(FundingRate {
            symbol: "BTCUSDT".into(),
            rate_bps: 50,
            next_funding_time: Utc::now(),
            timestamp: Utc::now(),
        });
        exchange.set_balance(Balance::new("USDT", 100_000_000_000, 0));
        exchange
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_enters_hedge_on_strong_funding() {
        let exchange = seeded_exchange();
        let mut config = BotConfig::default();
        config.timing.eval_tick_ms = 200;
        config.strategy.trend_window = 6;
        let worker = Worker::new(exchange.clone(), Arc::new(config), Arc::new(MemoryAuditSink::new()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = worker.engine();
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        // Feed the ticker so the ws stream stays fresh, and let ticks roll
        // until the hedge engages.
        let mut engaged = false;
        for _ in 0..200 {
            exchange.inject_event(crate::adapter::StreamEvent::Ticker(Ticker {
                symbol: "BTCUSDT".into(),
                bid_quote: 49_995_000_000,
                ask_quote: 50_005_000_000,
                last_quote: 50_000_000_000,
                volume_base: 0,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(Duration::from_millis(200)).await;
            if matches!(engine.hedge_state().await, HedgeState::Active { .. }) {
                engaged = true;
                break;
            }
        }
        assert!(engaged, "worker never entered the hedge");

        // Venue shows the short leg.
        assert!(exchange.get_position("BTCUSDT").await.unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stays_flat_on_weak_funding() {
        let exchange = seeded_exchange();
        exchange.set_funding_rate(FundingRate {
            symbol: "BTCUSDT".into(),
            rate_bps: 2, // below min threshold and low regime
            next_funding_time: Utc::now(),
            timestamp: Utc::now(),
        });
        let mut config = BotConfig::default();
        config.timing.eval_tick_ms = 200;
        config.strategy.trend_window = 6;
        let worker = Worker::new(exchange.clone(), Arc::new(config), Arc::new(MemoryAuditSink::new()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = worker.engine();
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        for _ in 0..30 {
            exchange.inject_event(crate::adapter::StreamEvent::Ticker(Ticker {
                symbol: "BTCUSDT".into(),
                bid_quote: 49_995_000_000,
                ask_quote: 50_005_000_000,
                last_quote: 50_000_000_000,
                volume_base: 0,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(!engine.hedge_engaged().await);
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("worker should stop")
            .unwrap()
            .unwrap();
    }
}
