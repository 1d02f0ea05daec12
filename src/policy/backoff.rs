//! Exponential backoff with jitter.
//!
//! Delay for attempt `n` is `min(initial * multiplier^n, max)` plus a
//! uniform jitter in `[0, delay * jitter_factor)`. The multiplication
//! saturates, so the cap holds even for attempt counts where the raw
//! product would overflow.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
    pub jitter_factor: f64,
    /// Attempts allowed before the caller gives up. `None` = unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(60),
            jitter_factor: 0.1,
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    /// Longer ceiling for throttle-classified disconnects and 429s.
    pub fn rate_limited() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Raw capped delay without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis().min(u64::MAX as u128) as u64;
        let factor = self
            .multiplier
            .checked_pow(attempt)
            .map(u64::from)
            .unwrap_or(u64::MAX);
        let raw_ms = initial_ms.saturating_mul(factor);
        let max_ms = self.max.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(raw_ms.min(max_ms))
    }

    /// Capped delay plus uniform jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return base;
        }
        let span_ms = (base.as_millis() as f64 * self.jitter_factor).max(0.0);
        let jitter_ms = rand::thread_rng().gen_range(0.0..=span_ms.max(f64::MIN_POSITIVE));
        base + Duration::from_millis(jitter_ms as u64)
    }
}

/// Attempt counter over a [`BackoffConfig`].
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay, or `None` once the attempt cap is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let delay = self.config.delay(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
