//! Worker registry, lifecycle coordination and phased shutdown.
//!
//! An [`Engine`] owns the queue shared by every worker, the set of running
//! worker tasks and the lifecycle state. It is generic over the queued unit:
//! [`WorkerPool`](crate::WorkerPool) queues single jobs, while
//! [`BatchPool`](crate::BatchPool) queues whole batches. What happens to a
//! unit is decided by the [`Execute`] implementation supplied at start-up.
//!
//! Workers are Tokio tasks. Each has a child of the pool's cancellation token
//! so it can be retired on its own (adaptive sizing) or together with every
//! other worker (shutdown).

use crate::config::{DrainPolicy, PoolConfig};
use crate::error::Result;
use crate::lifecycle::{Lifecycle, PoolState, ShutdownReport};
use crate::metrics::{Gauges, MetricsSnapshot, PoolMetrics};
use crate::pool::adaptive;
use crate::pool::worker::{Enrolled, Execute, WorkerContext, worker_loop};
use crate::queue::JobQueue;
use core::future::Future;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct WorkerSlot {
    id: usize,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Index-addressable registry of spawned workers.
#[derive(Default)]
struct WorkerSet {
    next_id: usize,
    active: Vec<WorkerSlot>,
    /// Workers asked to stop individually; joined at shutdown.
    retired: Vec<(usize, JoinHandle<()>)>,
}

/// Counts jobs waiting for a worker, including any held outside the shared
/// queue. Without one, the backlog is the shared queue's length.
pub(crate) type Backlog = Box<dyn Fn() -> usize + Send + Sync>;

/// State shared between the engine, its workers and background tasks.
pub(crate) struct Shared<T> {
    pub(crate) queue: JobQueue<T>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) metrics: Arc<PoolMetrics>,
    pub(crate) executor: Arc<dyn Execute<T>>,
    pub(crate) drain: DrainPolicy,
    pub(crate) workers_alive: Arc<AtomicUsize>,
    pub(crate) busy: Arc<AtomicUsize>,
    /// Ids of worker tasks that have not yet completed or been aborted.
    roster: Arc<Mutex<BTreeSet<usize>>>,
    backlog: Option<Backlog>,
    workers: Mutex<WorkerSet>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    report: Mutex<Option<ShutdownReport>>,
    shutdown_timeout: Duration,
}

impl<T> Shared<T>
where
    T: Send + 'static,
{
    /// Spawns one more worker. Returns its id, or `None` once the pool has
    /// left the `Running` state.
    pub(crate) fn spawn_worker(self: &Arc<Self>) -> Option<usize> {
        let mut workers = self.workers.lock();
        if !self.lifecycle.is_running() {
            return None;
        }

        let id = workers.next_id;
        workers.next_id += 1;

        let token = self.lifecycle.token().child_token();
        let ctx = WorkerContext {
            id,
            token: token.clone(),
        };
        let enrolled = Enrolled::new(id, &self.roster, &self.workers_alive);
        let fut = worker_loop(ctx, Arc::clone(self), enrolled);

        #[cfg(feature = "tracing")]
        let fut = {
            use tracing::Instrument;
            fut.instrument(tracing::debug_span!("worker", id))
        };

        let handle = tokio::spawn(fut);
        workers.active.push(WorkerSlot { id, token, handle });
        Some(id)
    }

    /// Stops the most recently spawned worker after its current unit. The
    /// last remaining worker is never retired.
    pub(crate) fn retire_worker(&self) -> Option<usize> {
        let mut workers = self.workers.lock();
        if workers.active.len() <= 1 || !self.lifecycle.is_running() {
            return None;
        }
        let slot = workers.active.pop()?;
        slot.token.cancel();

        workers.retired.retain(|(_, handle)| !handle.is_finished());
        workers.retired.push((slot.id, slot.handle));
        Some(slot.id)
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.lock().active.len()
    }

    pub(crate) fn workers_alive(&self) -> usize {
        self.workers_alive.load(Ordering::Acquire)
    }

    pub(crate) fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Jobs waiting for a worker.
    pub(crate) fn backlog(&self) -> usize {
        match &self.backlog {
            Some(backlog) => backlog(),
            None => self.queue.len(),
        }
    }

    /// Closes the queue, joins every worker until `deadline`, aborts the
    /// stragglers and answers whatever is left in the queue. `rejected`
    /// counts jobs already answered before they reached the queue.
    async fn finish_shutdown(self: Arc<Self>, deadline: Instant, rejected: usize) -> ShutdownReport {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        self.queue.close();

        let mut handles: Vec<(usize, JoinHandle<()>)> = {
            let mut workers = self.workers.lock();
            let active = core::mem::take(&mut workers.active);
            let retired = core::mem::take(&mut workers.retired);
            active
                .into_iter()
                .map(|slot| (slot.id, slot.handle))
                .chain(retired)
                .collect()
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("Waiting for {} workers to exit", handles.len());

        let joined = tokio::time::timeout_at(
            deadline,
            futures::future::join_all(handles.iter_mut().map(|(_, handle)| handle)),
        )
        .await;

        match joined {
            Ok(_results) => {
                #[cfg(feature = "tracing")]
                for ((_id, _), _result) in handles.iter().zip(&_results) {
                    if let Err(_e) = _result {
                        tracing::error!("Worker {_id} terminated abnormally: {_e}");
                    }
                }
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Shutdown timed out; aborting remaining workers");
            }
        }

        let outstanding: Vec<usize> = handles
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, handle)| {
                handle.abort();
                *id
            })
            .collect();

        let abandoned_jobs = rejected
            + self
                .queue
                .drain()
                .into_iter()
                .map(|unit| self.executor.abandon(unit))
                .sum::<usize>();

        let report = ShutdownReport {
            outstanding,
            abandoned_jobs,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Worker pool stopped ({} aborted workers, {} abandoned jobs)",
            report.outstanding.len(),
            report.abandoned_jobs
        );

        // Publish the report before the state so waiters always find it.
        *self.report.lock() = Some(report.clone());
        self.lifecycle.mark_stopped();
        report
    }

    /// Report for a shutdown still in progress: workers that have not exited
    /// and jobs that have not been answered yet.
    fn interim_report(&self) -> ShutdownReport {
        ShutdownReport {
            outstanding: self.roster.lock().iter().copied().collect(),
            abandoned_jobs: self.backlog(),
        }
    }
}

/// Owner handle of a running pool.
///
/// Dropping the engine without calling [`Engine::shutdown`] still stops the
/// pool: submissions are refused, the queue is closed and workers exit once
/// they have applied the drain policy.
pub(crate) struct Engine<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T> Engine<T>
where
    T: Send + 'static,
{
    /// Validates `config` and spawns its workers (and the adaptive monitor,
    /// if configured). Must be called from within a Tokio runtime.
    ///
    /// `backlog` counts jobs held outside the shared queue as well; adaptive
    /// sizing and interim shutdown reports use it.
    pub(crate) fn start(
        config: &PoolConfig,
        executor: Arc<dyn Execute<T>>,
        metrics: Arc<PoolMetrics>,
        backlog: Option<Backlog>,
    ) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: JobQueue::new(config.queue_capacity, config.discipline),
            lifecycle: Lifecycle::new(),
            metrics,
            executor,
            drain: config.drain,
            workers_alive: Arc::new(AtomicUsize::new(0)),
            busy: Arc::new(AtomicUsize::new(0)),
            roster: Arc::new(Mutex::new(BTreeSet::new())),
            backlog,
            workers: Mutex::new(WorkerSet::default()),
            monitor: Mutex::new(None),
            report: Mutex::new(None),
            shutdown_timeout: config.shutdown_timeout,
        });

        for _ in 0..config.workers {
            shared.spawn_worker();
        }

        if let Some(adaptive) = config.adaptive {
            let monitor = tokio::spawn(adaptive::monitor(Arc::clone(&shared), adaptive));
            *shared.monitor.lock() = Some(monitor);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Started {} workers (queue capacity {}, {:?}, {:?})",
            config.workers,
            config.queue_capacity,
            config.discipline,
            config.drain,
        );

        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
        &self.shared
    }

    pub(crate) fn queue(&self) -> &JobQueue<T> {
        &self.shared.queue
    }

    pub(crate) fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.shared.metrics
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        self.shared.lifecycle.token()
    }

    pub(crate) fn state(&self) -> PoolState {
        self.shared.lifecycle.state()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.lifecycle.is_running()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    pub(crate) fn workers_alive(&self) -> usize {
        self.shared.workers_alive()
    }

    /// Builds a snapshot with `queue_depth` supplied by the caller, who knows
    /// how to count units that are not in the shared queue yet.
    pub(crate) fn snapshot(&self, queue_depth: usize, queue_capacity: usize) -> MetricsSnapshot {
        self.shared.metrics.snapshot(Gauges {
            state: self.state(),
            workers_alive: self.workers_alive(),
            queue_depth,
            queue_capacity,
        })
    }

    /// Deadline for a shutdown that starts now.
    fn shutdown_deadline(&self) -> Instant {
        Instant::now() + self.shared.shutdown_timeout
    }

    /// Moves to `ShuttingDown` and cancels every worker token. Returns `true`
    /// for the caller that performed the transition.
    fn begin_shutdown(&self) -> bool {
        let first = self.shared.lifecycle.begin_shutdown();
        if first {
            #[cfg(feature = "tracing")]
            tracing::info!("Refusing new jobs ({} queued)", self.shared.backlog());
        }
        first
    }

    /// Waits (until `deadline`) for another caller's shutdown to complete and
    /// returns its report. If it has not completed by then, reports the
    /// workers still alive and the jobs still waiting.
    async fn await_shutdown(&self, deadline: Instant) -> ShutdownReport {
        let _ = tokio::time::timeout_at(deadline, self.shared.lifecycle.stopped()).await;
        let report = self.shared.report.lock().clone();
        report.unwrap_or_else(|| self.shared.interim_report())
    }

    /// Full shutdown: refuse new work, stop or drain workers, join them within
    /// the shutdown timeout. Safe to call concurrently and repeatedly.
    pub(crate) async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_after(|_deadline| async { 0 }).await
    }

    /// Like [`Engine::shutdown`], with `flush` run before the workers are
    /// joined. It receives the shutdown deadline and returns how many jobs it
    /// answered itself.
    ///
    /// Only the caller that starts the shutdown calls `flush`. The remaining
    /// steps run on their own task, so dropping this future does not leave
    /// the pool half stopped.
    pub(crate) async fn shutdown_after<F, Fut>(&self, flush: F) -> ShutdownReport
    where
        F: FnOnce(Instant) -> Fut,
        Fut: Future<Output = usize> + Send + 'static,
    {
        let deadline = self.shutdown_deadline();
        if !self.begin_shutdown() {
            return self.await_shutdown(deadline).await;
        }

        let flush = flush(deadline);
        let shared = Arc::clone(&self.shared);
        let finisher = tokio::spawn(async move {
            let rejected = flush.await;
            shared.finish_shutdown(deadline, rejected).await
        });

        match finisher.await {
            Ok(report) => report,
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Shutdown task terminated abnormally: {_e}");
                self.await_shutdown(deadline).await
            }
        }
    }
}

impl<T> Drop for Engine<T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        if self.shared.lifecycle.begin_shutdown() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Worker pool dropped while running; stopping workers");
            if let Some(monitor) = self.shared.monitor.lock().take() {
                monitor.abort();
            }
            self.shared.queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::worker::WorkerContext;
    use futures::future::BoxFuture;
    use tokio::sync::Semaphore;

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

    #[tokio::test(start_paused = true)]
    async fn unfinished_shutdown_reports_live_workers_and_backlog() {
        let gate = Arc::new(Semaphore::new(0));
        let engine = Engine::start(
            &PoolConfig::new(2),
            Arc::new(Gated(Arc::clone(&gate))),
            Arc::new(PoolMetrics::new()),
            None,
        )
        .unwrap();

        for unit in 0..3 {
            engine.queue().try_push(unit, 0).unwrap();
        }
        while engine.shared().busy() < 2 {
            tokio::task::yield_now().await;
        }

        let report = engine.shared().interim_report();
        assert_eq!(report.outstanding, vec![0, 1]);
        assert_eq!(report.abandoned_jobs, 1);

        gate.add_permits(100);
        assert!(engine.shutdown().await.is_clean());
        assert!(engine.shared().interim_report().outstanding.is_empty());
    }
}
