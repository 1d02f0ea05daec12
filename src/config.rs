//! Bot configuration.
//!
//! Every component gets its own config struct with defaults; `BotConfig`
//! aggregates them and applies environment overrides (`FA_*` variables).
//! Validation failures are configuration errors and exit the process with
//! code 1.

use std::time::Duration;

use crate::types::Amount;

fn env_parse<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

fn env_bool(key: &str, target: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        *target = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

// ─────────────────────────────────────────────────────────
// Timing
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Evaluation tick cadence.
    pub eval_tick_ms: u64,
    /// Funding-rate pull cadence.
    pub funding_refresh_ms: u64,
    /// Account (balances + positions + open orders) pull cadence.
    pub account_refresh_ms: u64,
    /// Reconciler cadence.
    pub reconcile_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            eval_tick_ms: 2_000,
            funding_refresh_ms: 30_000,
            account_refresh_ms: 30_000,
            reconcile_ms: 60_000,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Freshness
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FreshnessConfig {
    pub ticker_stale_ms: u64,
    pub funding_stale_ms: u64,
    pub account_stale_ms: u64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            ticker_stale_ms: 5_000,
            funding_stale_ms: 60_000,
            account_stale_ms: 45_000,
        }
    }
}

impl FreshnessConfig {
    /// Each max-age is bounded to its legal range.
    pub fn validate(&self) -> Result<(), String> {
        let bounds = [
            ("ticker_stale_ms", self.ticker_stale_ms, 1_000, 60_000),
            ("funding_stale_ms", self.funding_stale_ms, 5_000, 600_000),
            ("account_stale_ms", self.account_stale_ms, 5_000, 300_000),
        ];
        for (name, v, lo, hi) in bounds {
            if v < lo || v > hi {
                return Err(format!("{name}={v} outside [{lo}, {hi}]"));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Risk limits
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RiskConfig {
    pub max_position_notional_quote: Amount,
    pub warn_position_notional_quote: Amount,
    pub max_leverage_bps: i128,
    pub max_daily_loss_quote: Amount,
    pub max_drawdown_bps: i128,
    pub min_liquidation_distance_bps: i128,
    pub warn_liquidation_distance_bps: i128,
    pub max_margin_utilization_bps: i128,
    pub warn_margin_utilization_bps: i128,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_notional_quote: 10_000_000_000, // $10k at 6 quote decimals
            warn_position_notional_quote: 7_500_000_000,
            max_leverage_bps: 30_000, // 3x
            max_daily_loss_quote: 500_000_000, // $500
            max_drawdown_bps: 1_000,  // 10%
            min_liquidation_distance_bps: 2_000, // 20%
            warn_liquidation_distance_bps: 3_000, // 30%
            max_margin_utilization_bps: 8_000, // 80%
            warn_margin_utilization_bps: 7_000, // 70%
        }
    }
}

// ─────────────────────────────────────────────────────────
// Strategy
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Minimum current funding rate to enter.
    pub min_funding_rate_bps: i128,
    /// Exit when the predicted rate drops below this.
    pub exit_funding_rate_bps: i128,
    /// Realized funding yield that triggers a take-profit exit.
    pub target_yield_bps: i128,
    /// Trend window length in funding snapshots.
    pub trend_window: usize,
    /// Quote size of a new hedge.
    pub entry_size_quote: Amount,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_funding_rate_bps: 10,
            exit_funding_rate_bps: 3,
            target_yield_bps: 100,
            trend_window: 24,
            entry_size_quote: 1_000_000_000, // $1k
        }
    }
}

// ─────────────────────────────────────────────────────────
// Slippage
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SlippageConfig {
    pub max_slippage_bps: i128,
    pub warn_slippage_bps: i128,
    /// Book depth must cover this multiple of the requested quantity.
    pub min_liquidity_multiplier: i128,
}

impl Default for SlippageConfig {
    fn default() -> Self {
        Self {
            max_slippage_bps: 30,
            warn_slippage_bps: 15,
            min_liquidity_multiplier: 2,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub order_ack_timeout_ms: u64,
    pub order_fill_timeout_ms: u64,
    pub max_partial_fill_retries: u32,
    pub max_drift_bps: i128,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_ack_timeout_ms: 30_000,
            order_fill_timeout_ms: 60_000,
            max_partial_fill_retries: 3,
            max_drift_bps: 50,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Circuit breakers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
    pub half_open_successes: u32,
}

impl CircuitConfig {
    pub fn execution() -> Self {
        Self {
            consecutive_failures: 2,
            cooldown_ms: 30_000,
            half_open_successes: 1,
        }
    }

    pub fn request() -> Self {
        Self {
            consecutive_failures: 5,
            cooldown_ms: 10_000,
            half_open_successes: 2,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ─────────────────────────────────────────────────────────
// Rate limits
// ─────────────────────────────────────────────────────────

/// One namespaced token bucket: `capacity` tokens, `refill_per_sec` refill.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: u64,
    pub refill_per_sec: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub public: BucketConfig,
    pub private: BucketConfig,
    pub orders: BucketConfig,
    pub account: BucketConfig,
    /// Per-call timeout inside the request policy.
    pub request_timeout_ms: u64,
    /// Max retry attempts for retryable failures.
    pub max_retries: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            public: BucketConfig { capacity: 20, refill_per_sec: 10 },
            private: BucketConfig { capacity: 10, refill_per_sec: 5 },
            orders: BucketConfig { capacity: 5, refill_per_sec: 2 },
            account: BucketConfig { capacity: 10, refill_per_sec: 5 },
            request_timeout_ms: 10_000,
            max_retries: 3,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Position size drift below this is a warning, above it critical.
    pub size_tolerance_bps: i128,
    /// Balance drift above this is critical.
    pub balance_critical_bps: i128,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            size_tolerance_bps: 10,
            balance_critical_bps: 500,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Aggregate
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Perp contract symbol, e.g. `BTCUSDT`.
    pub perp_symbol: String,
    /// Spot pair symbol for the hedge leg.
    pub spot_symbol: String,
    /// Base asset (the spot leg's balance asset).
    pub base_asset: String,
    /// Quote asset.
    pub quote_asset: String,
    /// Base-asset precision (decimals of one whole unit).
    pub base_decimals: u32,
    /// Paper adapter, no live orders.
    pub dry_run: bool,
    pub timing: TimingConfig,
    pub freshness: FreshnessConfig,
    pub risk: RiskConfig,
    pub strategy: StrategyConfig,
    pub slippage: SlippageConfig,
    pub execution: ExecutionConfig,
    pub execution_circuit: CircuitConfig,
    pub request_circuit: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub reconcile: ReconcileConfig,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            perp_symbol: "BTCUSDT".into(),
            spot_symbol: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            base_decimals: 8,
            dry_run: true,
            timing: TimingConfig::default(),
            freshness: FreshnessConfig::default(),
            risk: RiskConfig::default(),
            strategy: StrategyConfig::default(),
            slippage: SlippageConfig::default(),
            execution: ExecutionConfig::default(),
            execution_circuit: CircuitConfig::execution(),
            request_circuit: CircuitConfig::request(),
            rate_limit: RateLimitConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl BotConfig {
    /// Load defaults and apply `FA_*` environment overrides.
    pub fn from_env() -> Self {
        let mut c = Self::default();

        if let Ok(v) = std::env::var("FA_PERP_SYMBOL") {
            c.perp_symbol = v;
        }
        if let Ok(v) = std::env::var("FA_SPOT_SYMBOL") {
            c.spot_symbol = v;
        }
        if let Ok(v) = std::env::var("FA_BASE_ASSET") {
            c.base_asset = v;
        }
        if let Ok(v) = std::env::var("FA_QUOTE_ASSET") {
            c.quote_asset = v;
        }
        env_parse("FA_BASE_DECIMALS", &mut c.base_decimals);
        env_bool("FA_DRY_RUN", &mut c.dry_run);

        env_parse("FA_EVAL_TICK_MS", &mut c.timing.eval_tick_ms);
        env_parse("FA_FUNDING_REFRESH_MS", &mut c.timing.funding_refresh_ms);
        env_parse("FA_ACCOUNT_REFRESH_MS", &mut c.timing.account_refresh_ms);
        env_parse("FA_RECONCILE_MS", &mut c.timing.reconcile_ms);

        env_parse("FA_TICKER_STALE_MS", &mut c.freshness.ticker_stale_ms);
        env_parse("FA_FUNDING_STALE_MS", &mut c.freshness.funding_stale_ms);
        env_parse("FA_ACCOUNT_STALE_MS", &mut c.freshness.account_stale_ms);

        env_parse("FA_MAX_NOTIONAL_QUOTE", &mut c.risk.max_position_notional_quote);
        env_parse("FA_WARN_NOTIONAL_QUOTE", &mut c.risk.warn_position_notional_quote);
        env_parse("FA_MAX_LEVERAGE_BPS", &mut c.risk.max_leverage_bps);
        env_parse("FA_MAX_DAILY_LOSS_QUOTE", &mut c.risk.max_daily_loss_quote);
        env_parse("FA_MAX_DRAWDOWN_BPS", &mut c.risk.max_drawdown_bps);

        env_parse("FA_MIN_FUNDING_RATE_BPS", &mut c.strategy.min_funding_rate_bps);
        env_parse("FA_EXIT_FUNDING_RATE_BPS", &mut c.strategy.exit_funding_rate_bps);
        env_parse("FA_TARGET_YIELD_BPS", &mut c.strategy.target_yield_bps);
        env_parse("FA_TREND_WINDOW", &mut c.strategy.trend_window);
        env_parse("FA_ENTRY_SIZE_QUOTE", &mut c.strategy.entry_size_quote);

        env_parse("FA_MAX_SLIPPAGE_BPS", &mut c.slippage.max_slippage_bps);
        env_parse("FA_WARN_SLIPPAGE_BPS", &mut c.slippage.warn_slippage_bps);
        env_parse("FA_MIN_LIQUIDITY_MULT", &mut c.slippage.min_liquidity_multiplier);

        env_parse("FA_ORDER_ACK_TIMEOUT_MS", &mut c.execution.order_ack_timeout_ms);
        env_parse("FA_ORDER_FILL_TIMEOUT_MS", &mut c.execution.order_fill_timeout_ms);
        env_parse("FA_MAX_PARTIAL_FILL_RETRIES", &mut c.execution.max_partial_fill_retries);
        env_parse("FA_MAX_DRIFT_BPS", &mut c.execution.max_drift_bps);

        env_parse("FA_RECONCILE_SIZE_TOLERANCE_BPS", &mut c.reconcile.size_tolerance_bps);
        env_parse("FA_RECONCILE_BALANCE_CRITICAL_BPS", &mut c.reconcile.balance_critical_bps);

        env_parse("FA_EXEC_CB_FAILURES", &mut c.execution_circuit.consecutive_failures);
        env_parse("FA_EXEC_CB_COOLDOWN_MS", &mut c.execution_circuit.cooldown_ms);
        env_parse("FA_EXEC_CB_HALF_OPEN_SUCCESSES", &mut c.execution_circuit.half_open_successes);
        env_parse("FA_REQUEST_CB_FAILURES", &mut c.request_circuit.consecutive_failures);
        env_parse("FA_REQUEST_CB_COOLDOWN_MS", &mut c.request_circuit.cooldown_ms);
        env_parse("FA_REQUEST_CB_HALF_OPEN_SUCCESSES", &mut c.request_circuit.half_open_successes);

        env_parse("FA_RL_PUBLIC_CAPACITY", &mut c.rate_limit.public.capacity);
        env_parse("FA_RL_PUBLIC_REFILL", &mut c.rate_limit.public.refill_per_sec);
        env_parse("FA_RL_PRIVATE_CAPACITY", &mut c.rate_limit.private.capacity);
        env_parse("FA_RL_PRIVATE_REFILL", &mut c.rate_limit.private.refill_per_sec);
        env_parse("FA_RL_ORDERS_CAPACITY", &mut c.rate_limit.orders.capacity);
        env_parse("FA_RL_ORDERS_REFILL", &mut c.rate_limit.orders.refill_per_sec);
        env_parse("FA_RL_ACCOUNT_CAPACITY", &mut c.rate_limit.account.capacity);
        env_parse("FA_RL_ACCOUNT_REFILL", &mut c.rate_limit.account.refill_per_sec);
        env_parse("FA_REQUEST_TIMEOUT_MS", &mut c.rate_limit.request_timeout_ms);
        env_parse("FA_REQUEST_MAX_RETRIES", &mut c.rate_limit.max_retries);

        c
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.perp_symbol.is_empty() || self.spot_symbol.is_empty() {
            return Err("perp_symbol and spot_symbol must be set".into());
        }
        if self.timing.eval_tick_ms == 0 {
            return Err("eval_tick_ms must be positive".into());
        }
        self.freshness.validate()?;
        if self.risk.warn_position_notional_quote > self.risk.max_position_notional_quote {
            return Err("warn notional above max notional".into());
        }
        if self.risk.warn_margin_utilization_bps > self.risk.max_margin_utilization_bps {
            return Err("warn margin utilization above max".into());
        }
        if self.strategy.trend_window < 2 {
            return Err("trend_window must be at least 2".into());
        }
        if self.slippage.min_liquidity_multiplier < 1 {
            return Err("min_liquidity_multiplier must be at least 1".into());
        }
        if self.execution.max_partial_fill_retries == 0 {
            return Err("max_partial_fill_retries must be positive".into());
        }
        Ok(())
    }

    pub fn eval_tick(&self) -> Duration {
        Duration::from_millis(self.timing.eval_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn test_freshness_bounds() {
        let mut f = FreshnessConfig::default();
        f.ticker_stale_ms = 500;
        assert!(f.validate().is_err());
        f.ticker_stale_ms = 60_001;
        assert!(f.validate().is_err());
        f.ticker_stale_ms = 1_000;
        assert!(f.validate().is_ok());
    }

    #[test]
    fn test_warn_above_max_rejected() {
        let mut c = BotConfig::default();
        c.risk.warn_position_notional_quote = c.risk.max_position_notional_quote + 1;
        assert!(c.validate().is_err());
    }
}
