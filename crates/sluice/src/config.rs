//! Pool configuration.
//!
//! Every knob has a default, so `PoolConfig::default()` yields a working
//! FIFO pool with `2 × CPUs` workers, a queue of 100 slots per worker,
//! fail-fast submission, drain-on-shutdown and a 30 second shutdown timeout.
//! Variant policies (rate limit, circuit breaker, adaptive sizing) are off
//! unless configured.

use crate::error::{Error, Result};
use crate::queue::QueueDiscipline;
use core::num::NonZeroU32;
use core::time::Duration;

/// Queue slots allocated per worker when no explicit capacity is set.
pub const DEFAULT_QUEUE_MULTIPLIER: usize = 100;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_ADAPTIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Default worker count: two per logical CPU.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_mul(2).max(1)
}

/// What workers do with queued jobs once shutdown begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Keep processing until the queue is empty.
    #[default]
    Drain,
    /// Exit after the in-flight job; queued jobs are answered with
    /// `PoolShuttingDown`.
    StopImmediately,
}

/// How `submit` behaves when the queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backpressure {
    /// Fail fast with `PoolSaturated`.
    #[default]
    Reject,
    /// Wait for space until the pool shuts down.
    Block,
}

/// Token bucket shared by all workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: NonZeroU32,
    pub burst: NonZeroU32,
}

impl RateLimitConfig {
    /// A limiter allowing `per_second` jobs per second with a burst of the
    /// same size.
    pub const fn per_second(per_second: NonZeroU32) -> Self {
        Self {
            per_second,
            burst: per_second,
        }
    }

    #[must_use]
    pub const fn with_burst(mut self, burst: NonZeroU32) -> Self {
        self.burst = burst;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,
    /// How long the circuit stays open before a trial job is admitted.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub const fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    #[must_use]
    pub const fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.reset_timeout = reset_timeout;
        self
    }
}

/// Bounds and cadence for queue-depth driven resizing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdaptiveConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub interval: Duration,
    /// A worker is added when `queue depth > workers × scale_up_ratio`.
    pub scale_up_ratio: f64,
}

impl AdaptiveConfig {
    pub const fn new(min_workers: usize, max_workers: usize) -> Self {
        Self {
            min_workers,
            max_workers,
            interval: DEFAULT_ADAPTIVE_INTERVAL,
            scale_up_ratio: 2.0,
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_scale_up_ratio(mut self, scale_up_ratio: f64) -> Self {
        self.scale_up_ratio = scale_up_ratio;
        self
    }
}

/// Configuration for [`WorkerPool`](crate::WorkerPool) and
/// [`BatchPool`](crate::BatchPool).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub discipline: QueueDiscipline,
    pub drain: DrainPolicy,
    pub backpressure: Backpressure,
    pub shutdown_timeout: Duration,
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub adaptive: Option<AdaptiveConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let workers = default_workers();
        Self {
            workers,
            queue_capacity: workers.saturating_mul(DEFAULT_QUEUE_MULTIPLIER),
            discipline: QueueDiscipline::default(),
            drain: DrainPolicy::default(),
            backpressure: Backpressure::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            rate_limit: None,
            circuit_breaker: None,
            adaptive: None,
        }
    }
}

impl PoolConfig {
    /// A config with `workers` workers and the default queue multiplier.
    pub fn new(workers: usize) -> Self {
        Self::default()
            .with_workers(workers)
            .with_queue_capacity(workers.saturating_mul(DEFAULT_QUEUE_MULTIPLIER))
    }

    #[must_use]
    pub const fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the queue capacity to `workers × multiplier`.
    #[must_use]
    pub const fn with_queue_multiplier(mut self, multiplier: usize) -> Self {
        self.queue_capacity = self.workers.saturating_mul(multiplier);
        self
    }

    #[must_use]
    pub const fn with_discipline(mut self, discipline: QueueDiscipline) -> Self {
        self.discipline = discipline;
        self
    }

    #[must_use]
    pub const fn with_drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    #[must_use]
    pub const fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    #[must_use]
    pub const fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    #[must_use]
    pub const fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    #[must_use]
    pub const fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Checks that the settings describe a pool that can make progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::invalid_config("queue_capacity must be at least 1"));
        }
        if let Some(breaker) = &self.circuit_breaker {
            if breaker.max_failures == 0 {
                return Err(Error::invalid_config(
                    "circuit_breaker.max_failures must be at least 1",
                ));
            }
        }
        if let Some(adaptive) = &self.adaptive {
            if adaptive.min_workers == 0 {
                return Err(Error::invalid_config("adaptive.min_workers must be at least 1"));
            }
            if adaptive.min_workers > adaptive.max_workers {
                return Err(Error::invalid_config(format!(
                    "adaptive.min_workers ({}) exceeds adaptive.max_workers ({})",
                    adaptive.min_workers, adaptive.max_workers
                )));
            }
            if !(adaptive.min_workers..=adaptive.max_workers).contains(&self.workers) {
                return Err(Error::invalid_config(format!(
                    "workers ({}) must lie within the adaptive bounds {}..={}",
                    self.workers, adaptive.min_workers, adaptive.max_workers
                )));
            }
            if adaptive.interval.is_zero() {
                return Err(Error::invalid_config("adaptive.interval must be non-zero"));
            }
            if adaptive.scale_up_ratio.is_nan() || adaptive.scale_up_ratio <= 0.0 {
                return Err(Error::invalid_config("adaptive.scale_up_ratio must be positive"));
            }
        }
        Ok(())
    }
}

/// Grouping rules for [`BatchPool`](crate::BatchPool).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Longest a partial batch waits after its first job arrives.
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 32,
            max_wait: Duration::from_millis(10),
        }
    }
}

impl BatchConfig {
    pub const fn new(max_batch_size: usize, max_wait: Duration) -> Self {
        Self {
            max_batch_size,
            max_wait,
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty batch size.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::invalid_config("max_batch_size must be at least 1"));
        }
        Ok(())
    }
}
