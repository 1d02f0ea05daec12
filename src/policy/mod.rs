//! Outbound request policy.
//!
//! Every REST call to the exchange goes through [`RequestPolicy::execute`]:
//! weighted token acquisition from the namespaced bucket, a per-call
//! timeout, the request circuit breaker, and classified retry with backoff.
//! `Retry-After` hints are honored verbatim. Non-retryable failures (auth,
//! validation, business state) are returned untouched on the first attempt.

pub mod backoff;
pub mod circuit;
pub mod token_bucket;

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::adapter::ExchangeError;
use crate::config::RateLimitConfig;
use backoff::BackoffConfig;
use circuit::CircuitBreaker;
use token_bucket::{Namespace, RateLimiter};

pub struct RequestPolicy {
    limiter: RateLimiter,
    circuit: CircuitBreaker,
    backoff: BackoffConfig,
    request_timeout: Duration,
    max_retries: u32,
}

impl RequestPolicy {
    pub fn new(config: &RateLimitConfig, circuit: CircuitBreaker) -> Self {
        Self {
            limiter: RateLimiter::new(config),
            circuit,
            backoff: BackoffConfig::default(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_retries: config.max_retries,
        }
    }

    /// Run `op` under the full policy. `op` is re-invoked on each retry.
    pub async fn execute<T, F, Fut>(
        &self,
        namespace: Namespace,
        weight: u64,
        op: F,
    ) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.limiter.consume(namespace, weight).await;

            if !self.circuit.allow() {
                return Err(ExchangeError::Throttled {
                    retry_after: self.circuit.cooldown_remaining(),
                });
            }

            let result = match tokio::time::timeout(self.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ExchangeError::Timeout),
            };

            match result {
                Ok(value) => {
                    self.circuit.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    self.circuit.record_failure();
                    if attempt >= self.max_retries {
                        warn!(
                            namespace = namespace.as_str(),
                            attempts = attempt + 1,
                            error = %err,
                            "request failed, retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.backoff.delay(attempt));
                    debug!(
                        namespace = namespace.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
