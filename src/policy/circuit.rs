//! Circuit breaker: closed → open after N consecutive failures, half-open
//! after a cooldown, closed again after K half-open successes. A half-open
//! failure re-opens immediately.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner::Closed { consecutive_failures: 0 }),
        }
    }

    /// Current state; an expired cooldown flips open → half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Inner::Open { since } = *inner {
            if since.elapsed() >= self.config.cooldown() {
                *inner = Inner::HalfOpen { successes: 0 };
            }
        }
        match *inner {
            Inner::Closed { .. } => CircuitState::Closed,
            Inner::Open { .. } => CircuitState::Open,
            Inner::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Whether a call may proceed right now.
    pub fn allow(&self) -> bool {
        self.state() != CircuitState::Open
    }

    /// Time left before an open breaker half-opens.
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match *inner {
            Inner::Open { since } => Some(self.config.cooldown().saturating_sub(since.elapsed())),
            _ => None,
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match *inner {
            Inner::Closed { .. } => {
                *inner = Inner::Closed { consecutive_failures: 0 };
            }
            Inner::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.half_open_successes {
                    *inner = Inner::Closed { consecutive_failures: 0 };
                } else {
                    *inner = Inner::HalfOpen { successes };
                }
            }
            Inner::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match *inner {
            Inner::Closed { consecutive_failures } => {
                let consecutive_failures = consecutive_failures + 1;
                if consecutive_failures >= self.config.consecutive_failures {
                    warn!(circuit = self.name, failures = consecutive_failures, "circuit opened");
                    *inner = Inner::Open { since: Instant::now() };
                } else {
                    *inner = Inner::Closed { consecutive_failures };
                }
            }
            Inner::HalfOpen { .. } => {
                warn!(circuit = self.name, "half-open probe failed, circuit re-opened");
                *inner = Inner::Open { since: Instant::now() };
            }
            Inner::Open { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitConfig { consecutive_failures: 2, cooldown_ms: 30_000, half_open_successes: 1 },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let cb = breaker();
        assert!(cb.allow());
        cb.record_failure();
        assert!(cb.allow());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let cb = breaker();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_cooldown_then_closes() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.allow());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.cooldown_remaining().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_half_open_successes_required() {
        let cb = CircuitBreaker::new(
            "test",
            CircuitConfig { consecutive_failures: 1, cooldown_ms: 1_000, half_open_successes: 2 },
        );
        cb.record_failure();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
