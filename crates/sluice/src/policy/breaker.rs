//! Consecutive-failure circuit breaker.
//!
//! ```text
//! ┌────────┐  max_failures  ┌──────┐  reset_timeout  ┌──────────┐
//! │ Closed │ ─────────────► │ Open │ ──────────────► │ HalfOpen │
//! └────────┘                └──────┘ ◄────────────── └──────────┘
//!      ▲                               trial failed        │
//!      └───────────────────────────────────────────────────┘
//!                          trial succeeded
//! ```
//!
//! While `Open`, jobs are rejected with [`Error::CircuitOpen`] without running
//! the work function. Once `reset_timeout` has elapsed a single trial job is
//! admitted; every other job keeps being rejected until the trial settles.

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};
use core::fmt;
use core::future::Future;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    /// Asks to run one job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] while the circuit is open, or while it
    /// is half-open and the trial job has not settled yet.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        let mut state = self.state.lock();
        let trial = match state.circuit {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = state
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.reset_timeout);
                if !cooled {
                    return Err(Error::CircuitOpen);
                }
                state.circuit = CircuitState::HalfOpen;
                state.trial_in_flight = true;
                #[cfg(feature = "tracing")]
                tracing::info!("Circuit half-open, admitting a trial job");
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return Err(Error::CircuitOpen);
                }
                state.trial_in_flight = true;
                true
            }
        };
        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Runs `f` under the breaker and records its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] without calling `f` if the breaker
    /// refuses, otherwise whatever `f` returns.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let outcome = f().await;
        permit.record(outcome.is_ok());
        outcome
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                state.circuit = CircuitState::Closed;
                state.consecutive_failures = 0;
                state.opened_at = None;
                state.trial_in_flight = false;
                #[cfg(feature = "tracing")]
                tracing::info!("Circuit closed after successful trial");
            }
            // Late results from jobs admitted before the circuit opened.
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut state = self.state.lock();
        match state.circuit {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.config.max_failures {
                    state.circuit = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Circuit opened after {} consecutive failures",
                        state.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                state.circuit = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.trial_in_flight = false;
                #[cfg(feature = "tracing")]
                tracing::warn!("Trial job failed, circuit re-opened");
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Admission to run one job. Must be settled with [`Permit::record`];
/// dropping it unsettled counts as a failure.
#[must_use = "an unsettled permit counts as a failure"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn record(mut self, ok: bool) {
        self.settled = true;
        if ok {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn breaker(max_failures: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_max_failures(max_failures)
                .with_reset_timeout(Duration::from_secs(1)),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(Error::job_failed("down")) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u8> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker(3);
        for _ in 0..3 {
            assert_eq!(fail(&breaker).await, Err(Error::job_failed("down")));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let mut invoked = false;
        let out = breaker
            .call(|| {
                invoked = true;
                async { Ok(()) }
            })
            .await;
        assert_eq!(out, Err(Error::CircuitOpen));
        assert!(!invoked);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_count() {
        let breaker = breaker(3);
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_the_circuit() {
        let breaker = breaker(1);
        fail(&breaker).await.unwrap_err();
        assert_eq!(succeed(&breaker).await, Err(Error::CircuitOpen));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&breaker).await, Ok(7));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_the_circuit() {
        let breaker = breaker(1);
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(fail(&breaker).await, Err(Error::job_failed("down")));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(succeed(&breaker).await, Err(Error::CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_a_single_trial() {
        let breaker = breaker(1);
        fail(&breaker).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let trial = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen)));

        trial.record(true);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_counts_as_failure() {
        let breaker = breaker(1);
        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
