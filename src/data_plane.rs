//! Data plane: push and pull ingress.
//!
//! Owns the streaming connection (through the stream manager), the periodic
//! funding and account pullers, and per-stream health. `start` is
//! idempotent, runs the initial pulls inline, and only returns once the
//! state store is populated; `stop` cancels every timer, closes the stream
//! and waits for in-flight pulls to settle. Pull errors log and retry on
//! the next tick — they never escape the scheduler after startup.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use serde_json::json;

use crate::adapter::{ExchangeAdapter, ExchangeError, StreamEvent};
use crate::config::BotConfig;
use crate::lifecycle::audit::{AlertSeverity, AuditLog};
use crate::policy::token_bucket::Namespace;
use crate::policy::RequestPolicy;
use crate::reconcile::merge_open_orders;
use crate::state::StateStore;
use crate::stream::health::{StreamHealthMonitor, StreamSpec};
use crate::stream::manager::{ConnectionState, StreamManager, StreamManagerConfig, StreamSignal};

/// Everything a pull needs; clonable into the puller tasks.
#[derive(Clone)]
struct PullCtx {
    adapter: Arc<dyn ExchangeAdapter>,
    policy: Arc<RequestPolicy>,
    store: Arc<StateStore>,
    health: Arc<StreamHealthMonitor>,
    config: Arc<BotConfig>,
}

impl PullCtx {
    async fn pull_funding(&self) -> Result<(), ExchangeError> {
        let result = self
            .policy
            .execute(Namespace::Public, 1, || {
                self.adapter.get_funding_rate(&self.config.perp_symbol)
            })
            .await;
        match result {
            Ok(funding) => {
                self.store.update_funding_rate(funding).await;
                self.health.set_rest_healthy(true);
                Ok(())
            }
            Err(err) => {
                self.health.set_rest_healthy(false);
                Err(err)
            }
        }
    }

    /// Balances, positions and open orders fetched in parallel and applied
    /// as a single batch.
    async fn pull_account(&self) -> Result<(), ExchangeError> {
        let fetched = tokio::try_join!(
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_balances()),
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_positions()),
            self.policy.execute(Namespace::Account, 1, || self.adapter.get_open_orders(None)),
        );
        match fetched {
            Ok((balances, positions, open_orders)) => {
                let tracked = self.store.snapshot().await.open_orders;
                let merged = merge_open_orders(&tracked, &open_orders);
                self.store.update_account(balances, positions, merged).await;
                self.health.set_rest_healthy(true);
                Ok(())
            }
            Err(err) => {
                self.health.set_rest_healthy(false);
                Err(err)
            }
        }
    }

    async fn apply_event(&self, event: StreamEvent) {
        self.health.record_message(event.stream_name());
        match event {
            StreamEvent::Ticker(ticker) => {
                if ticker.symbol == self.config.spot_symbol
                    || ticker.symbol == self.config.perp_symbol
                {
                    self.store.update_ticker(ticker).await;
                }
            }
            StreamEvent::MarkPrice { symbol, mark_price_quote, .. } => {
                self.store.update_mark_price(&symbol, mark_price_quote).await;
            }
            StreamEvent::OrderUpdate(order) => {
                // Order records are mutated only by the execution engine;
                // the push update is informational here.
                debug!(
                    exchange_order_id = %order.exchange_order_id,
                    status = ?order.status,
                    "order update"
                );
            }
        }
    }
}

#[derive(Clone, Copy)]
enum PullKind {
    Funding,
    Account,
}

pub struct DataPlane {
    ctx: PullCtx,
    manager: Arc<StreamManager>,
    audit: AuditLog,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    signal_rx: Mutex<Option<mpsc::Receiver<StreamSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    manager_task: Mutex<Option<JoinHandle<Result<(), ExchangeError>>>>,
}

impl DataPlane {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        policy: Arc<RequestPolicy>,
        store: Arc<StateStore>,
        audit: AuditLog,
        config: Arc<BotConfig>,
    ) -> Arc<Self> {
        let ticker_stale = Duration::from_millis(config.freshness.ticker_stale_ms);
        let health = Arc::new(StreamHealthMonitor::new(
            vec![
                StreamSpec::required("ticker", ticker_stale / 2, ticker_stale),
                StreamSpec::allow_silence("mark", ticker_stale / 2, ticker_stale),
                StreamSpec::allow_silence("orders", Duration::from_secs(5), Duration::from_secs(60)),
            ],
            None,
        ));
        let (manager, signal_rx) =
            StreamManager::new(adapter.stream_connector(), StreamManagerConfig::default());
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            ctx: PullCtx { adapter, policy, store, health, config },
            manager,
            audit,
            shutdown_tx,
            running: AtomicBool::new(false),
            signal_rx: Mutex::new(Some(signal_rx)),
            tasks: Mutex::new(Vec::new()),
            manager_task: Mutex::new(None),
        })
    }

    pub fn health(&self) -> Arc<StreamHealthMonitor> {
        self.ctx.health.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_generation(&self) -> u64 {
        self.manager.current_generation()
    }

    /// Idempotent. Opens the stream, waits for the first live connection,
    /// runs the initial pulls inline, installs the periodic pullers.
    pub async fn start(&self) -> Result<(), ExchangeError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.ctx.adapter.connect().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        // Bring the stream up; the very first connect failure propagates.
        let mut manager_task = tokio::spawn(self.manager.clone().run(self.shutdown_tx.subscribe()));
        let mut state_rx = self.manager.state();
        let connected = tokio::select! {
            changed = state_rx.wait_for(|s| *s == ConnectionState::Connected) => changed.is_ok(),
            result = &mut manager_task => {
                self.running.store(false, Ordering::SeqCst);
                return Err(match result {
                    Ok(Err(err)) => err,
                    Ok(Ok(())) => ExchangeError::Network("stream closed during startup".into()),
                    Err(join) => ExchangeError::Fatal(format!("stream task panicked: {join}")),
                });
            }
        };
        if !connected {
            self.running.store(false, Ordering::SeqCst);
            return Err(ExchangeError::Network("stream state channel closed".into()));
        }

        // Supervise the stream for the rest of its life: a fatal end (auth
        // exhaustion, cap exhaustion) is an operator alert, and the worker
        // pauses through the usual stale-data path.
        let supervisor = {
            let ctx = self.ctx.clone();
            let audit = self.audit.clone();
            tokio::spawn(async move {
                let result = match manager_task.await {
                    Ok(result) => result,
                    Err(join) => Err(ExchangeError::Fatal(format!("stream task panicked: {join}"))),
                };
                if let Err(err) = &result {
                    let code = match err {
                        ExchangeError::Auth(_) => "STREAM_AUTH_FAILURE",
                        _ => "STREAM_FATAL",
                    };
                    audit.alert(
                        AlertSeverity::Critical,
                        code,
                        json!({ "error": err.to_string() }),
                    );
                    ctx.store.set_ws_connected(false).await;
                    ctx.health.reset_streams();
                }
                result
            })
        };
        *self.manager_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(supervisor);
        self.ctx.store.set_ws_connected(true).await;

        // Initial pulls run inline; their failure is a startup failure.
        self.ctx.pull_funding().await?;
        self.ctx.pull_account().await?;

        let mut tasks = Vec::new();

        // Signal drain.
        let signal_rx = self
            .signal_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("data plane started twice without reset");
        tasks.push(tokio::spawn(drain_signals(
            self.ctx.clone(),
            self.manager.clone(),
            signal_rx,
        )));

        // Periodic pullers.
        tasks.push(spawn_puller(
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
            "funding",
            Duration::from_millis(self.ctx.config.timing.funding_refresh_ms),
            PullKind::Funding,
        ));
        tasks.push(spawn_puller(
            self.ctx.clone(),
            self.shutdown_tx.subscribe(),
            "account",
            Duration::from_millis(self.ctx.config.timing.account_refresh_ms),
            PullKind::Account,
        ));

        // Health checker.
        tasks.push(self.ctx.health.spawn_checker(Duration::from_secs(1)));

        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;
        info!("data plane started");
        Ok(())
    }

    /// Cancel timers, close the stream, await in-flight work.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let task = self.manager_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.ctx.store.set_ws_connected(false).await;
        let _ = self.ctx.adapter.disconnect().await;
        info!("data plane stopped");
    }
}

async fn drain_signals(
    ctx: PullCtx,
    manager: Arc<StreamManager>,
    mut signals: mpsc::Receiver<StreamSignal>,
) {
    while let Some(signal) = signals.recv().await {
        match signal {
            StreamSignal::Connected { generation } => {
                info!(generation, "stream live, catching up via REST");
                ctx.store.set_ws_connected(true).await;
                // Catch-up pull so the store is current before new events.
                if let Err(err) = ctx.pull_funding().await {
                    warn!(error = %err, "catch-up funding pull failed");
                }
                if let Err(err) = ctx.pull_account().await {
                    warn!(error = %err, "catch-up account pull failed");
                }
            }
            StreamSignal::Event { event, generation } => {
                // Superseded-generation events must not touch the store.
                if generation != manager.current_generation() {
                    debug!(generation, "discarding stale-generation event");
                    continue;
                }
                // A handler panic must not stop the inbound pipeline.
                if AssertUnwindSafe(ctx.apply_event(event)).catch_unwind().await.is_err() {
                    error!("stream event handler panicked, continuing");
                }
            }
            StreamSignal::Disconnected { category } => {
                warn!(?category, "stream down");
                ctx.store.set_ws_connected(false).await;
                ctx.health.reset_streams();
            }
        }
    }
}

fn spawn_puller(
    ctx: PullCtx,
    mut shutdown: watch::Receiver<bool>,
    name: &'static str,
    cadence: Duration,
    kind: PullKind,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The inline initial pull already ran; skip the immediate tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let result = match kind {
                        PullKind::Funding => ctx.pull_funding().await,
                        PullKind::Account => ctx.pull_account().await,
                    };
                    if let Err(err) = result {
                        // Transient: log, retry on the next tick.
                        warn!(puller = name, error = %err, "pull failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(puller = name, "puller stopped");
                        return;
                    }
                }
            }
        }
    })
}
