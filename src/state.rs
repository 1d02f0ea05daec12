//! Authoritative in-memory bot state.
//!
//! A single `BotState` owned by the [`StateStore`]; every mutation goes
//! through a typed setter that atomically replaces the affected
//! sub-collection and stamps the matching freshness marker. Readers get a
//! cloned snapshot — there is no reference through which downstream code
//! can mutate the store. Account fields only ever change as one batch, so
//! no evaluator tick observes a half-updated account.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::FreshnessConfig;
use crate::lifecycle::order::ManagedOrder;
use crate::types::{Balance, FundingRate, OrderBook, Position, Ticker};

#[derive(Debug, Clone, Default)]
pub struct BotState {
    pub ticker: Option<Ticker>,
    pub order_book: Option<OrderBook>,
    pub funding_rate: Option<FundingRate>,
    pub balances: HashMap<String, Balance>,
    pub positions: HashMap<String, Position>,
    pub open_orders: HashMap<String, ManagedOrder>,
    pub last_ticker_update: Option<Instant>,
    pub last_funding_update: Option<Instant>,
    pub last_account_update: Option<Instant>,
    pub ws_connected: bool,
}

pub struct StateStore {
    inner: RwLock<BotState>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self { inner: RwLock::new(BotState::default()) }
    }

    pub async fn snapshot(&self) -> BotState {
        self.inner.read().await.clone()
    }

    pub async fn update_ticker(&self, ticker: Ticker) {
        let mut state = self.inner.write().await;
        state.ticker = Some(ticker);
        state.last_ticker_update = Some(Instant::now());
    }

    pub async fn update_order_book(&self, book: OrderBook) {
        let mut state = self.inner.write().await;
        state.order_book = Some(book);
        state.last_ticker_update = Some(Instant::now());
    }

    pub async fn update_funding_rate(&self, funding: FundingRate) {
        let mut state = self.inner.write().await;
        state.funding_rate = Some(funding);
        state.last_funding_update = Some(Instant::now());
    }

    pub async fn update_balances(&self, balances: Vec<Balance>) {
        let mut state = self.inner.write().await;
        state.balances = balances.into_iter().map(|b| (b.asset.clone(), b)).collect();
        state.last_account_update = Some(Instant::now());
    }

    pub async fn update_positions(&self, positions: Vec<Position>) {
        let mut state = self.inner.write().await;
        state.positions = positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        state.last_account_update = Some(Instant::now());
    }

    pub async fn update_orders(&self, orders: Vec<ManagedOrder>) {
        let mut state = self.inner.write().await;
        state.open_orders = orders.into_iter().map(|o| (o.id.clone(), o)).collect();
        state.last_account_update = Some(Instant::now());
    }

    /// Reconciler batch: balances, positions and open orders land together
    /// under one write lock.
    pub async fn update_account(
        &self,
        balances: Vec<Balance>,
        positions: Vec<Position>,
        orders: Vec<ManagedOrder>,
    ) {
        let mut state = self.inner.write().await;
        state.balances = balances.into_iter().map(|b| (b.asset.clone(), b)).collect();
        state.positions = positions.into_iter().map(|p| (p.symbol.clone(), p)).collect();
        state.open_orders = orders.into_iter().map(|o| (o.id.clone(), o)).collect();
        state.last_account_update = Some(Instant::now());
    }

    /// Streaming mark-price refresh. Touches only the mark; account
    /// freshness still comes from REST pulls.
    pub async fn update_mark_price(&self, symbol: &str, mark_price_quote: crate::types::Amount) {
        let mut state = self.inner.write().await;
        if let Some(position) = state.positions.get_mut(symbol) {
            position.mark_price_quote = mark_price_quote;
        }
    }

    /// Upsert a single tracked order (execution engine lifecycle updates).
    pub async fn upsert_order(&self, order: ManagedOrder) {
        let mut state = self.inner.write().await;
        state.open_orders.insert(order.id.clone(), order);
    }

    /// Drop an order that reached a terminal status.
    pub async fn remove_order(&self, order_id: &str) {
        let mut state = self.inner.write().await;
        state.open_orders.remove(order_id);
    }

    pub async fn set_ws_connected(&self, connected: bool) {
        let mut state = self.inner.write().await;
        state.ws_connected = connected;
    }

    pub async fn reset(&self) {
        let mut state = self.inner.write().await;
        *state = BotState::default();
    }
}

fn within(age: Option<Instant>, max: Duration) -> bool {
    match age {
        Some(then) => then.elapsed() <= max,
        None => false,
    }
}

/// True iff the socket is up and every freshness marker is within its
/// configured max age.
pub fn is_state_fresh(state: &BotState, config: &FreshnessConfig) -> bool {
    state.ws_connected
        && within(state.last_ticker_update, Duration::from_millis(config.ticker_stale_ms))
        && within(state.last_funding_update, Duration::from_millis(config.funding_stale_ms))
        && within(state.last_account_update, Duration::from_millis(config.account_stale_ms))
}
