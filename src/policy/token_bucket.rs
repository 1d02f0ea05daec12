//! Weighted token buckets for outbound rate limiting.
//!
//! Each namespace (`public`, `private`, `orders`, `account`) gets its own
//! bucket. `consume(weight)` waits until enough tokens are available; the
//! bucket refills continuously at its configured rate.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{BucketConfig, RateLimitConfig};

/// Request-policy namespaces, one bucket each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Public,
    Private,
    Orders,
    Account,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Public => "public",
            Namespace::Private => "private",
            Namespace::Orders => "orders",
            Namespace::Account => "account",
        }
    }
}

/// Tokens are tracked in millitokens so sub-second refill stays integral.
const MILLI: u64 = 1_000;

#[derive(Debug)]
struct BucketState {
    capacity_milli: u64,
    tokens_milli: u64,
    refill_per_sec: u64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_millis().min(u64::MAX as u128) as u64;
        if elapsed_ms == 0 {
            return;
        }
        let added_milli = elapsed_ms.saturating_mul(self.refill_per_sec);
        self.tokens_milli = (self.tokens_milli + added_milli).min(self.capacity_milli);
        self.last_refill = now;
    }

    /// Milliseconds until `needed_milli` tokens will be available.
    fn wait_ms(&self, needed_milli: u64) -> u64 {
        let deficit = needed_milli.saturating_sub(self.tokens_milli);
        if deficit == 0 || self.refill_per_sec == 0 {
            return 0;
        }
        deficit.div_ceil(self.refill_per_sec)
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: BucketConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity_milli: config.capacity.saturating_mul(MILLI),
                tokens_milli: config.capacity.saturating_mul(MILLI),
                refill_per_sec: config.refill_per_sec.saturating_mul(MILLI).max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until `weight` whole tokens are available, then take them.
    pub async fn consume(&self, weight: u64) {
        let needed_milli = weight.saturating_mul(MILLI);
        loop {
            let wait_ms = {
                let mut state = self.state.lock().await;
                state.refill(Instant::now());
                if state.tokens_milli >= needed_milli {
                    state.tokens_milli -= needed_milli;
                    return;
                }
                state.wait_ms(needed_milli)
            };
            tokio::time::sleep(Duration::from_millis(wait_ms.max(1))).await;
        }
    }

    /// Whole tokens currently available, after refill.
    pub async fn available(&self) -> u64 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now());
        state.tokens_milli / MILLI
    }
}

/// Namespaced bucket registry.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<Namespace, TokenBucket>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(Namespace::Public, TokenBucket::new(config.public));
        buckets.insert(Namespace::Private, TokenBucket::new(config.private));
        buckets.insert(Namespace::Orders, TokenBucket::new(config.orders));
        buckets.insert(Namespace::Account, TokenBucket::new(config.account));
        Self { buckets }
    }

    pub async fn consume(&self, namespace: Namespace, weight: u64) {
        // All four namespaces are inserted at construction.
        if let Some(bucket) = self.buckets.get(&namespace) {
            bucket.consume(weight).await;
        }
    }
}
