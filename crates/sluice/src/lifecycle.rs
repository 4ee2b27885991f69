//! Pool lifecycle: `Running → ShuttingDown → Stopped`.
//!
//! The state lives in a [`watch`] channel so any number of observers can wait
//! for a transition, and the cancellation signal is a [`CancellationToken`]
//! that every worker (through a child token) and every blocked submitter
//! listens on. Both transitions happen at most once.

use core::fmt;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        })
    }
}

/// Outcome of a completed shutdown.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Ids of workers that had not exited by the shutdown deadline and were
    /// aborted.
    pub outstanding: Vec<usize>,
    /// Jobs still queued at the end of shutdown. Each was answered with
    /// [`Error::PoolShuttingDown`](crate::Error::PoolShuttingDown).
    pub abandoned_jobs: usize,
}

impl ShutdownReport {
    /// `true` if every worker exited on its own and no job was left behind.
    pub fn is_clean(&self) -> bool {
        self.outstanding.is_empty() && self.abandoned_jobs == 0
    }
}

pub(crate) struct Lifecycle {
    state: watch::Sender<PoolState>,
    token: CancellationToken,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(PoolState::Running);
        Self {
            state,
            token: CancellationToken::new(),
        }
    }

    pub(crate) const fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Moves `Running → ShuttingDown` and fires the cancellation signal.
    /// Returns `true` only for the caller that performed the transition.
    pub(crate) fn begin_shutdown(&self) -> bool {
        let first = self.state.send_if_modified(|state| {
            if *state == PoolState::Running {
                *state = PoolState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if first {
            self.token.cancel();
        }
        first
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.send_replace(PoolState::Stopped);
    }

    /// Resolves once the state is `Stopped`.
    pub(crate) async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| *state == PoolState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn shutdown_transition_happens_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_running());
        assert!(!lifecycle.token().is_cancelled());

        assert!(lifecycle.begin_shutdown());
        assert!(!lifecycle.begin_shutdown());
        assert_eq!(lifecycle.state(), PoolState::ShuttingDown);
        assert!(lifecycle.token().is_cancelled());
    }

    #[tokio::test]
    async fn observers_see_stopped() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.stopped().await })
        };
        lifecycle.begin_shutdown();
        lifecycle.mark_stopped();
        waiter.await.unwrap();
        assert_eq!(lifecycle.state(), PoolState::Stopped);
        assert_eq!(PoolState::Stopped.to_string(), "stopped");
    }
}
