//! Admission policies applied by workers before a job runs.
//!
//! - [`RateLimiter`]: a token bucket shared by the whole pool.
//! - [`CircuitBreaker`]: stops calling a failing work function until it has
//!   had time to recover.

mod breaker;
mod limiter;

pub use breaker::*;
pub use limiter::*;

use crate::config::PoolConfig;
use crate::error::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The policies configured for one pool, applied in order: rate limit first,
/// then the circuit breaker.
#[derive(Debug)]
pub(crate) struct Policies {
    limiter: Option<RateLimiter>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Policies {
    pub(crate) fn from_config(config: &PoolConfig) -> Self {
        Self {
            limiter: config.rate_limit.map(RateLimiter::new),
            breaker: config.circuit_breaker.map(|c| Arc::new(CircuitBreaker::new(c))),
        }
    }

    pub(crate) fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Waits for a rate-limit token, then asks the breaker for a permit.
    /// Without a breaker there is nothing to settle and `None` is returned.
    pub(crate) async fn admit(&self, cancel: &CancellationToken) -> Result<Option<Permit<'_>>> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(cancel).await?;
        }
        self.breaker
            .as_deref()
            .map(CircuitBreaker::try_acquire)
            .transpose()
    }
}
