//! In-memory paper exchange.
//!
//! Backs dry-run mode and the engine tests: orders fill deterministically
//! according to a scripted fill plan (full fill by default), account state
//! is adjusted accordingly, and the stream connector replays whatever the
//! test (or the built-in market simulator) injects.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapter::{
    ExchangeAdapter, ExchangeError, ExchangeOrder, ExchangeOrderStatus, OrderRequest, StreamEvent,
};
use crate::stream::manager::{InboundFrame, StreamConnector};
use crate::types::{
    Amount, Balance, BookLevel, FundingRate, MarketKind, OrderBook, OrderSide, Position, Side,
    Ticker, BPS_SCALE,
};

/// How the next created order behaves.
#[derive(Debug, Clone)]
pub enum FillBehavior {
    /// Immediate full fill.
    Fill,
    /// Terminal partial: fills `filled_base`, then the venue cancels.
    Partial { filled_base: Amount },
    /// Venue rejects the order.
    Reject { reason: String },
}

#[derive(Debug, Default)]
struct PaperInner {
    ticker: Option<Ticker>,
    book: Option<OrderBook>,
    funding: Option<FundingRate>,
    balances: HashMap<String, Balance>,
    positions: HashMap<String, Position>,
    orders: HashMap<String, ExchangeOrder>,
    fill_plan: VecDeque<FillBehavior>,
}

pub struct PaperExchange {
    inner: Mutex<PaperInner>,
    connected: AtomicBool,
    order_seq: AtomicU64,
    connector: Arc<PaperConnector>,
    base_asset: String,
    quote_asset: String,
    base_decimals: u32,
}

impl PaperExchange {
    pub fn new(base_asset: &str, quote_asset: &str, base_decimals: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PaperInner::default()),
            connected: AtomicBool::new(false),
            order_seq: AtomicU64::new(1),
            connector: Arc::new(PaperConnector::default()),
            base_asset: base_asset.to_string(),
            quote_asset: quote_asset.to_string(),
            base_decimals,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Seeding ──

    pub fn set_ticker(&self, ticker: Ticker) {
        self.lock().ticker = Some(ticker);
    }

    pub fn set_order_book(&self, book: OrderBook) {
        self.lock().book = Some(book);
    }

    pub fn set_funding_rate(&self, funding: FundingRate) {
        self.lock().funding = Some(funding);
    }

    pub fn set_balance(&self, balance: Balance) {
        self.lock().balances.insert(balance.asset.clone(), balance);
    }

    pub fn set_position(&self, position: Position) {
        self.lock().positions.insert(position.symbol.clone(), position);
    }

    pub fn clear_position(&self, symbol: &str) {
        self.lock().positions.remove(symbol);
    }

    /// Script the next orders' behavior, FIFO. Defaults to `Fill`.
    pub fn push_fill_behavior(&self, behavior: FillBehavior) {
        self.lock().fill_plan.push_back(behavior);
    }

    /// Total orders ever created (terminal included).
    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    /// Inject a frame into the live stream session (if any).
    pub fn inject_event(&self, event: StreamEvent) {
        self.connector.inject(InboundFrame::Event(event));
    }

    /// Close the live stream session with the given close code.
    pub fn close_stream(&self, code: u16, reason: &str) {
        self.connector.inject(InboundFrame::Closed { code, reason: reason.to_string() });
    }

    fn execution_price(&self, inner: &PaperInner, request: &OrderRequest) -> Amount {
        if let Some(price) = request.price_quote {
            return price;
        }
        if let Some(book) = &inner.book {
            let best = match request.side {
                OrderSide::Buy => book.best_ask_quote(),
                OrderSide::Sell => book.best_bid_quote(),
            };
            if let Some(price) = best {
                return price;
            }
        }
        inner.ticker.as_ref().map(|t| t.last_quote).unwrap_or(0)
    }

    fn apply_fill(&self, inner: &mut PaperInner, request: &OrderRequest, filled_base: Amount, price_quote: Amount) {
        let scale = 10_i128.pow(self.base_decimals);
        let notional_quote = filled_base * price_quote / scale;
        match request.market {
            MarketKind::Spot => {
                let base = inner
                    .balances
                    .entry(self.base_asset.clone())
                    .or_insert_with(|| Balance::new(self.base_asset.clone(), 0, 0));
                match request.side {
                    OrderSide::Buy => {
                        base.available_base += filled_base;
                    }
                    OrderSide::Sell => {
                        base.available_base -= filled_base;
                    }
                }
                base.total_base = base.available_base + base.held_base;
                let quote = inner
                    .balances
                    .entry(self.quote_asset.clone())
                    .or_insert_with(|| Balance::new(self.quote_asset.clone(), 0, 0));
                match request.side {
                    OrderSide::Buy => quote.available_base -= notional_quote,
                    OrderSide::Sell => quote.available_base += notional_quote,
                }
                quote.total_base = quote.available_base + quote.held_base;
            }
            MarketKind::Perp => {
                // Sell opens/extends a short, buy reduces it.
                let entry = inner.positions.get(&request.symbol).cloned();
                match (entry, request.side) {
                    (None, OrderSide::Sell) => {
                        inner.positions.insert(
                            request.symbol.clone(),
                            Position {
                                symbol: request.symbol.clone(),
                                side: Side::Short,
                                size_base: filled_base,
                                entry_price_quote: price_quote,
                                mark_price_quote: price_quote,
                                liquidation_price_quote: Some(
                                    price_quote + price_quote * 3_000 / BPS_SCALE,
                                ),
                                unrealized_pnl_quote: 0,
                                leverage_bps: 10_000,
                                margin_quote: notional_quote,
                            },
                        );
                    }
                    (Some(mut p), OrderSide::Sell) => {
                        p.size_base += filled_base;
                        inner.positions.insert(request.symbol.clone(), p);
                    }
                    (Some(mut p), OrderSide::Buy) => {
                        p.size_base -= filled_base;
                        if p.size_base <= 0 {
                            inner.positions.remove(&request.symbol);
                        } else {
                            inner.positions.insert(request.symbol.clone(), p);
                        }
                    }
                    (None, OrderSide::Buy) => {}
                }
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    async fn connect(&self) -> Result<(), ExchangeError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        self.lock()
            .ticker
            .clone()
            .filter(|t| t.symbol == symbol)
            .ok_or_else(|| ExchangeError::Business(format!("no ticker for {symbol}")))
    }

    async fn get_order_book(
        &self,
        symbol: &str,
        depth: Option<usize>,
    ) -> Result<OrderBook, ExchangeError> {
        let mut book = self
            .lock()
            .book
            .clone()
            .filter(|b| b.symbol == symbol)
            .ok_or_else(|| ExchangeError::Business(format!("no order book for {symbol}")))?;
        if let Some(depth) = depth {
            book.bids.truncate(depth);
            book.asks.truncate(depth);
        }
        Ok(book)
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate, ExchangeError> {
        self.lock()
            .funding
            .clone()
            .filter(|f| f.symbol == symbol)
            .ok_or_else(|| ExchangeError::Business(format!("no funding rate for {symbol}")))
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance, ExchangeError> {
        Ok(self
            .lock()
            .balances
            .get(asset)
            .cloned()
            .unwrap_or_else(|| Balance::new(asset, 0, 0)))
    }

    async fn get_balances(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self.lock().balances.values().cloned().collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        Ok(self.lock().positions.values().cloned().collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Position>, ExchangeError> {
        Ok(self.lock().positions.get(symbol).cloned())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        Ok(self
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map(|s| o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: OrderRequest) -> Result<ExchangeOrder, ExchangeError> {
        let mut inner = self.lock();
        let behavior = inner.fill_plan.pop_front().unwrap_or(FillBehavior::Fill);
        let price_quote = self.execution_price(&inner, &request);
        if price_quote <= 0 {
            return Err(ExchangeError::Validation("no price available".into()));
        }

        let id = format!("paper-{}", self.order_seq.fetch_add(1, Ordering::SeqCst));
        let order = match behavior {
            FillBehavior::Fill => {
                self.apply_fill(&mut inner, &request, request.quantity_base, price_quote);
                ExchangeOrder {
                    exchange_order_id: id.clone(),
                    symbol: request.symbol.clone(),
                    market: request.market,
                    side: request.side,
                    order_type: request.order_type,
                    status: ExchangeOrderStatus::Filled,
                    quantity_base: request.quantity_base,
                    filled_quantity_base: request.quantity_base,
                    avg_fill_price_quote: Some(price_quote),
                    timestamp: Utc::now(),
                }
            }
            FillBehavior::Partial { filled_base } => {
                let filled_base = filled_base.min(request.quantity_base);
                self.apply_fill(&mut inner, &request, filled_base, price_quote);
                ExchangeOrder {
                    exchange_order_id: id.clone(),
                    symbol: request.symbol.clone(),
                    market: request.market,
                    side: request.side,
                    order_type: request.order_type,
                    status: ExchangeOrderStatus::Canceled,
                    quantity_base: request.quantity_base,
                    filled_quantity_base: filled_base,
                    avg_fill_price_quote: Some(price_quote),
                    timestamp: Utc::now(),
                }
            }
            FillBehavior::Reject { reason } => {
                return Err(ExchangeError::Business(format!("order rejected: {reason}")));
            }
        };
        inner.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<(), ExchangeError> {
        let mut inner = self.lock();
        match inner.orders.get_mut(exchange_order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = ExchangeOrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Err(ExchangeError::Business("order already terminal".into())),
            None => Err(ExchangeError::Business("unknown order".into())),
        }
    }

    async fn get_order(&self, exchange_order_id: &str) -> Result<ExchangeOrder, ExchangeError> {
        self.lock()
            .orders
            .get(exchange_order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::Business("unknown order".into()))
    }

    fn stream_connector(&self) -> Arc<dyn StreamConnector> {
        self.connector.clone()
    }
}

// ─────────────────────────────────────────────────────────
// Paper stream connector
// ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PaperConnector {
    session: Mutex<Option<mpsc::Sender<InboundFrame>>>,
}

impl PaperConnector {
    pub fn inject(&self, frame: InboundFrame) {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = session.as_ref() {
            let _ = tx.try_send(frame);
        }
    }
}

#[async_trait]
impl StreamConnector for PaperConnector {
    async fn connect(&self) -> Result<mpsc::Receiver<InboundFrame>, ExchangeError> {
        let (tx, rx) = mpsc::channel(256);
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        Ok(rx)
    }
}

// ─────────────────────────────────────────────────────────
// Dry-run market simulator
// ─────────────────────────────────────────────────────────

/// Feed the paper exchange with a synthetic market so a dry run exercises
/// the whole decision loop: a drifting ticker each second and a fresh
/// funding snapshot every `funding_interval` ticks.
pub fn spawn_market_simulator(
    exchange: Arc<PaperExchange>,
    symbol: String,
    start_price_quote: Amount,
    funding_rate_bps: i128,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(%symbol, "paper market simulator running");
        let mut price = start_price_quote;
        let mut tick: u64 = 0;
        loop {
            // Bounded random walk, ±5 bps per tick.
            let step_bps: i128 = rand::thread_rng().gen_range(-5..=5);
            price += price * step_bps / BPS_SCALE;
            let spread = (price / 2_000).max(1);

            let ticker = Ticker {
                symbol: symbol.clone(),
                bid_quote: price - spread,
                ask_quote: price + spread,
                last_quote: price,
                volume_base: 1_000_000,
                timestamp: Utc::now(),
            };
            let book = OrderBook {
                symbol: symbol.clone(),
                bids: (1..=5)
                    .map(|i| BookLevel {
                        price_quote: price - spread * i,
                        qty_base: 200_000_000,
                    })
                    .collect(),
                asks: (1..=5)
                    .map(|i| BookLevel {
                        price_quote: price + spread * i,
                        qty_base: 200_000_000,
                    })
                    .collect(),
                timestamp: Utc::now(),
            };
            exchange.set_ticker(ticker.clone());
            exchange.set_order_book(book);
            exchange.inject_event(StreamEvent::Ticker(ticker));

            if tick % 30 == 0 {
                exchange.set_funding_rate(FundingRate {
                    symbol: symbol.clone(),
                    rate_bps: funding_rate_bps,
                    next_funding_time: Utc::now() + chrono::Duration::hours(8),
                    timestamp: Utc::now(),
                });
            }
            tick += 1;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    })
}
