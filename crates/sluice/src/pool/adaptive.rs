//! Queue-depth driven pool sizing.

use crate::config::AdaptiveConfig;
use crate::pool::engine::Shared;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scale {
    Up(usize),
    Down(usize),
}

/// Adds a worker when the backlog outgrows the pool, removes one when the
/// queue is empty and some workers are idle. Changes by at most one worker
/// per call and never leaves `min_workers..=max_workers`.
pub(crate) fn rebalance<T>(shared: &Arc<Shared<T>>, config: &AdaptiveConfig) -> Option<Scale>
where
    T: Send + 'static,
{
    let workers = shared.worker_count();
    let depth = shared.backlog();

    if depth as f64 > workers as f64 * config.scale_up_ratio && workers < config.max_workers {
        return shared.spawn_worker().map(Scale::Up);
    }
    if depth == 0 && shared.busy() < workers && workers > config.min_workers {
        return shared.retire_worker().map(Scale::Down);
    }
    None
}

pub(crate) async fn monitor<T>(shared: Arc<Shared<T>>, config: AdaptiveConfig)
where
    T: Send + 'static,
{
    let token = shared.lifecycle.token().clone();
    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => match rebalance(&shared, &config) {
                Some(Scale::Up(_id)) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(
                        "Scaled up: spawned worker {_id} ({} queued)",
                        shared.backlog()
                    );
                }
                Some(Scale::Down(_id)) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Scaled down: retired worker {_id}");
                }
                None => {}
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::metrics::PoolMetrics;
    use crate::pool::engine::{Backlog, Engine};
    use crate::pool::worker::{Execute, WorkerContext};
    use futures::future::BoxFuture;
    use portable_atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    /// Holds every unit until the gate opens.
    struct Gated(Arc<Semaphore>);

    impl Execute<u32> for Gated {
        fn execute<'a>(&'a self, _ctx: &'a WorkerContext, _unit: u32) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let _permit = self.0.acquire().await;
            })
        }

        fn abandon(&self, _unit: u32) -> usize {
            1
        }
    }

    fn engine(workers: usize, gate: &Arc<Semaphore>) -> Engine<u32> {
        Engine::start(
            &PoolConfig::new(workers),
            Arc::new(Gated(Arc::clone(gate))),
            Arc::new(PoolMetrics::new()),
            None,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn grows_with_backlog_up_to_max() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = engine(1, &gate);
        let config = AdaptiveConfig::new(1, 2).with_scale_up_ratio(1.0);

        for unit in 0..5 {
            engine.queue().try_push(unit, 0).unwrap();
        }
        assert_eq!(rebalance(engine.shared(), &config), Some(Scale::Up(1)));
        assert_eq!(engine.worker_count(), 2);
        // At the ceiling.
        assert_eq!(rebalance(engine.shared(), &config), None);

        gate.add_permits(100);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shrinks_when_idle_down_to_min() {
        let gate = Arc::new(Semaphore::new(100));
        let engine = engine(3, &gate);
        let config = AdaptiveConfig::new(2, 4);
        tokio::task::yield_now().await;

        assert_eq!(rebalance(engine.shared(), &config), Some(Scale::Down(2)));
        assert_eq!(engine.worker_count(), 2);
        assert_eq!(rebalance(engine.shared(), &config), None);

        let report = engine.shutdown().await;
        assert!(report.is_clean());
        assert_eq!(engine.workers_alive(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn holds_steady_with_small_backlog() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = engine(2, &gate);
        let config = AdaptiveConfig::new(1, 4);

        engine.queue().try_push(1, 0).unwrap();
        // Depth 1 is neither above 2 × 2 nor empty.
        assert_eq!(rebalance(engine.shared(), &config), None);

        gate.add_permits(100);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn counts_jobs_held_outside_the_queue() {
        let gate = Arc::new(Semaphore::new(0));
        let held = Arc::new(AtomicUsize::new(0));
        let backlog: Backlog = {
            let held = Arc::clone(&held);
            Box::new(move || held.load(Ordering::Acquire))
        };
        let engine = Engine::start(
            &PoolConfig::new(1),
            Arc::new(Gated(Arc::clone(&gate))),
            Arc::new(PoolMetrics::new()),
            Some(backlog),
        )
        .unwrap();
        let config = AdaptiveConfig::new(1, 2).with_scale_up_ratio(1.0);

        assert_eq!(rebalance(engine.shared(), &config), None);
        // The shared queue is empty; the backlog lives elsewhere.
        held.store(4, Ordering::Release);
        assert_eq!(rebalance(engine.shared(), &config), Some(Scale::Up(1)));

        gate.add_permits(100);
        engine.shutdown().await;
    }
}
