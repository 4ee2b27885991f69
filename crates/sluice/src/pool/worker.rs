use crate::config::DrainPolicy;
use crate::error::{Error, Result};
use crate::job::{JobId, JobResult};
use crate::pool::engine::Shared;
use crate::queue::Popped;
use core::any::Any;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Runs queued units on behalf of a worker.
///
/// `execute` must deliver exactly one result to every job contained in
/// `unit`. `abandon` answers the jobs of a unit that will never run and
/// returns how many there were.
pub(crate) trait Execute<T>: Send + Sync + 'static {
    fn execute<'a>(&'a self, ctx: &'a WorkerContext, unit: T) -> BoxFuture<'a, ()>;

    fn abandon(&self, unit: T) -> usize;
}

/// Identity and cancellation scope of one worker.
#[derive(Debug)]
pub(crate) struct WorkerContext {
    pub(crate) id: usize,
    /// Child of the pool token. Cancelled on shutdown or when this worker
    /// alone is retired.
    pub(crate) token: CancellationToken,
}

/// Decrements a gauge when dropped. Created by whoever incremented it.
pub(crate) struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    pub(crate) fn raise(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(gauge))
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A worker's entry in the roster of live workers and its share of the
/// "workers alive" gauge. Both are released when the task completes or is
/// aborted.
pub(crate) struct Enrolled {
    id: usize,
    roster: Arc<Mutex<BTreeSet<usize>>>,
    _alive: GaugeGuard,
}

impl Enrolled {
    pub(crate) fn new(
        id: usize,
        roster: &Arc<Mutex<BTreeSet<usize>>>,
        alive: &Arc<AtomicUsize>,
    ) -> Self {
        roster.lock().insert(id);
        Self {
            id,
            roster: Arc::clone(roster),
            _alive: GaugeGuard::raise(alive),
        }
    }
}

impl Drop for Enrolled {
    fn drop(&mut self) {
        self.roster.lock().remove(&self.id);
    }
}

/// Worker task: pops units from the shared queue and executes them one at a
/// time until the queue closes or the worker's token is cancelled.
///
/// On cancellation a worker whose pool is still running has been retired and
/// exits at once. Otherwise the pool is shutting down and the drain policy
/// decides whether the remaining backlog is processed first.
///
/// `_enrolled` keeps the worker counted as alive until the task completes or
/// is aborted.
pub(crate) async fn worker_loop<T>(ctx: WorkerContext, shared: Arc<Shared<T>>, _enrolled: Enrolled)
where
    T: Send + 'static,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {} started", ctx.id);

    loop {
        match shared.queue.pop(&ctx.token).await {
            Popped::Item(unit) => run_unit(&shared, &ctx, unit).await,
            Popped::Closed => break,
            Popped::Cancelled => {
                if shared.lifecycle.is_running() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {} retired", ctx.id);
                    break;
                }
                if shared.drain == DrainPolicy::Drain {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {} draining backlog", ctx.id);
                    while let Popped::Item(unit) = shared.queue.pop_until_closed().await {
                        run_unit(&shared, &ctx, unit).await;
                    }
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {} stopped", ctx.id);
}

async fn run_unit<T>(shared: &Shared<T>, ctx: &WorkerContext, unit: T)
where
    T: Send + 'static,
{
    let _busy = GaugeGuard::raise(&shared.busy);
    shared.executor.execute(ctx, unit).await;
}

/// Polls `fut`, turning a panic into [`Error::WorkerPanic`].
pub(crate) async fn catch_panic<F>(fut: F) -> Result<F::Output>
where
    F: Future,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|payload| Error::WorkerPanic {
            message: panic_message(payload.as_ref()),
        })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Writes `outcome` to the job's result channel, if it has one.
///
/// The channel holds one value, so this never blocks. A submitter that has
/// stopped listening (for example after a timeout) simply drops the result.
pub(crate) fn deliver<O>(
    _worker_id: usize,
    _job_id: &JobId,
    reply: Option<oneshot::Sender<JobResult<O>>>,
    outcome: JobResult<O>,
) {
    if let Some(reply) = reply {
        if reply.send(outcome).is_err() {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                "Worker {_worker_id} dropped result for job {_job_id}: receiver gone"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explode() -> u8 {
        panic!("boom")
    }

    fn explode_with(code: u8) -> u8 {
        panic!("code {code}")
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let out = catch_panic(async { explode() }).await;
        assert_eq!(
            out,
            Err(Error::WorkerPanic {
                message: "boom".to_owned()
            })
        );

        let out = catch_panic(async { explode_with(7) }).await;
        assert_eq!(
            out,
            Err(Error::WorkerPanic {
                message: "code 7".to_owned()
            })
        );

        assert_eq!(catch_panic(async { 3_u8 }).await, Ok(3));
    }

    #[tokio::test]
    async fn delivery_tolerates_a_gone_receiver() {
        let (tx, rx) = oneshot::channel::<JobResult<u8>>();
        drop(rx);
        deliver(0, &JobId::from("j"), Some(tx), Ok(1));

        let (tx, rx) = oneshot::channel::<JobResult<u8>>();
        deliver(0, &JobId::from("j"), Some(tx), Ok(2));
        assert_eq!(rx.await.unwrap(), Ok(2));
    }

    #[test]
    fn gauge_guard_restores_count() {
        let gauge = Arc::new(AtomicUsize::new(0));
        let first = GaugeGuard::raise(&gauge);
        let second = GaugeGuard::raise(&gauge);
        assert_eq!(gauge.load(Ordering::Acquire), 2);
        drop(first);
        drop(second);
        assert_eq!(gauge.load(Ordering::Acquire), 0);
    }

    #[test]
    fn enrolment_is_released_on_drop() {
        let roster = Arc::new(Mutex::new(BTreeSet::new()));
        let alive = Arc::new(AtomicUsize::new(0));
        let first = Enrolled::new(3, &roster, &alive);
        let second = Enrolled::new(5, &roster, &alive);
        assert_eq!(alive.load(Ordering::Acquire), 2);
        assert_eq!(roster.lock().iter().copied().collect::<Vec<_>>(), [3, 5]);

        drop(first);
        assert_eq!(roster.lock().iter().copied().collect::<Vec<_>>(), [5]);
        drop(second);
        assert!(roster.lock().is_empty());
        assert_eq!(alive.load(Ordering::Acquire), 0);
    }
}
