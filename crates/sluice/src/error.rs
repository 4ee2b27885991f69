//! Error types for the dispatch engine.
//!
//! This module defines the central `Error` enum, which captures every way a
//! submission or a job can fail to produce a value. Errors are always local to
//! one job or one submission: a failing job never takes down its worker or
//! the pool.
//!
//! ## Error Cases
//! - `PoolSaturated`: The queue is at capacity and the caller asked for
//!   non-blocking submission.
//! - `PoolShuttingDown`: The cancellation signal has fired.
//! - `Timeout`: The awaited result did not arrive before the deadline. The job
//!   itself may still complete.
//! - `WorkerPanic`: The work function panicked while running the job.
//! - `JobFailed`: The work function returned an error.
//! - `RateLimited`: The worker's wait for a rate-limit token was cancelled.
//! - `CircuitOpen`: The circuit breaker rejected the job without running it.
//! - `Abandoned`: The worker was stopped before it could reply.
//! - `InvalidConfig`: A pool was built from an inconsistent configuration.

use core::time::Duration;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type for submissions and job outcomes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The queue is full and the submission was non-blocking.
    #[error("Worker pool is saturated (queue capacity {capacity})")]
    PoolSaturated { capacity: usize },

    /// A submission arrived after the pool started shutting down.
    #[error("Worker pool is shutting down")]
    PoolShuttingDown,

    /// No result was available within the deadline.
    #[error("Timed out after {elapsed:?} waiting for job result")]
    Timeout { elapsed: Duration },

    /// The work function panicked.
    #[error("Job panicked: {message}")]
    WorkerPanic { message: String },

    /// The work function reported a failure.
    #[error("Job failed: {reason}")]
    JobFailed { reason: String },

    /// Waiting for a rate-limit token was cancelled.
    #[error("Rate limit wait was cancelled")]
    RateLimited,

    /// The circuit breaker is open.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// The job was dropped without a result, e.g. its worker was aborted at
    /// the shutdown deadline.
    #[error("Job was abandoned before producing a result")]
    Abandoned,

    /// The pool configuration is inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Convenience constructor for work functions.
    pub fn job_failed(reason: impl Into<String>) -> Self {
        Self::JobFailed {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the job was refused before any work was attempted.
    ///
    /// Callers usually answer these with a "retry later" signal instead of a
    /// hard failure.
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::PoolSaturated { .. }
                | Self::PoolShuttingDown
                | Self::RateLimited
                | Self::CircuitOpen
        )
    }

    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_distinguished_from_failures() {
        assert!(Error::PoolSaturated { capacity: 4 }.is_rejection());
        assert!(Error::PoolShuttingDown.is_rejection());
        assert!(Error::CircuitOpen.is_rejection());
        assert!(Error::RateLimited.is_rejection());

        assert!(!Error::job_failed("boom").is_rejection());
        assert!(
            !Error::Timeout {
                elapsed: Duration::from_millis(5)
            }
            .is_rejection()
        );
        assert!(!Error::Abandoned.is_rejection());
    }

    #[test]
    fn display_carries_context() {
        assert_eq!(
            Error::PoolSaturated { capacity: 10 }.to_string(),
            "Worker pool is saturated (queue capacity 10)"
        );
        assert_eq!(Error::job_failed("bad input").to_string(), "Job failed: bad input");
    }
}
