//! Token-bucket rate limiting shared by every worker of a pool.

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use tokio_util::sync::CancellationToken;

pub struct RateLimiter {
    inner: DefaultDirectRateLimiter,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(config.per_second).allow_burst(config.burst);
        Self {
            inner: Governor::direct(quota),
            config,
        }
    }

    pub const fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Waits for a token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] if `cancel` fires before a token is
    /// available.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        if self.inner.check().is_ok() {
            return Ok(());
        }
        tokio::select! {
            biased;
            () = self.inner.until_ready() => Ok(()),
            () = cancel.cancelled() => Err(Error::RateLimited),
        }
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

impl core::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::num::NonZeroU32;
    use core::time::Duration;

    fn limiter(per_second: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::per_second(NonZeroU32::new(per_second).unwrap())
                .with_burst(NonZeroU32::new(burst).unwrap()),
        )
    }

    #[test]
    fn burst_is_available_immediately() {
        let limiter = limiter(1, 3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = limiter(20, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let started = std::time::Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn cancelled_wait_is_rate_limited() {
        let limiter = limiter(1, 1);
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();

        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });
        assert_eq!(limiter.acquire(&cancel).await, Err(Error::RateLimited));
    }
}
