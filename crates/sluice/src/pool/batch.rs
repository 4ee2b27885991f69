//! Batched execution: jobs are grouped and handed to the work function as one
//! unit.
//!
//! Submissions land in a bounded inbox. An accumulator task pulls from it and
//! closes a batch when it holds `max_batch_size` jobs or when `max_wait` has
//! elapsed since the batch's first job, whichever comes first. Closed batches
//! are queued for the workers like any other unit; the [`BatchHandler`]
//! returns one result per job, which is routed back to that job's channel.

use crate::config::{Backpressure, BatchConfig, DrainPolicy, PoolConfig};
use crate::error::{Error, Result};
use crate::job::{BatchHandler, Job, JobResult};
use crate::lifecycle::{PoolState, ShutdownReport};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::policy::Policies;
use crate::pool::engine::{Backlog, Engine, Shared};
use crate::pool::worker::{Execute, WorkerContext, catch_panic, deliver};
use crate::queue::PushError;
use core::time::Duration;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

pub(crate) struct Batch<I, O> {
    jobs: Vec<Job<I, O>>,
    queued: Queued,
}

impl<I, O> Batch<I, O> {
    fn new(jobs: Vec<Job<I, O>>, queued: &Arc<AtomicUsize>) -> Self {
        let queued = Queued::add(queued, jobs.len());
        Self { jobs, queued }
    }
}

/// A batch's share of the queued-jobs count, held from the moment its jobs
/// leave the inbox until a worker takes the batch apart.
struct Queued {
    count: Arc<AtomicUsize>,
    jobs: usize,
}

impl Queued {
    fn add(count: &Arc<AtomicUsize>, jobs: usize) -> Self {
        count.fetch_add(jobs, Ordering::AcqRel);
        Self {
            count: Arc::clone(count),
            jobs,
        }
    }

    fn add_one(&mut self) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.jobs += 1;
    }
}

impl Drop for Queued {
    fn drop(&mut self) {
        self.count.fetch_sub(self.jobs, Ordering::AcqRel);
    }
}

fn inbox_depth<T>(inbox: &mpsc::Sender<T>) -> usize {
    inbox.max_capacity() - inbox.capacity()
}

struct BatchExecutor<I, O> {
    handler: Arc<dyn BatchHandler<I, O>>,
    policies: Policies,
    metrics: Arc<PoolMetrics>,
}

impl<I, O> Execute<Batch<I, O>> for BatchExecutor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute<'a>(&'a self, ctx: &'a WorkerContext, batch: Batch<I, O>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let Batch { jobs, queued } = batch;
            drop(queued);
            let size = jobs.len();
            let _active = self.metrics.jobs_started(size as u64);

            let mut inputs = Vec::with_capacity(size);
            let mut replies = Vec::with_capacity(size);
            for job in jobs {
                let (id, input, reply) = job.into_parts();
                inputs.push((id.clone(), input));
                replies.push((id, reply));
            }

            let outcome = match self.policies.admit(&ctx.token).await {
                Ok(permit) => {
                    let handler = &self.handler;
                    let outcome = catch_panic(async move { handler.call(inputs).await }).await;
                    if let Some(permit) = permit {
                        let ok = outcome
                            .as_ref()
                            .is_ok_and(|results| results.iter().all(Result::is_ok));
                        permit.record(ok);
                    }
                    outcome
                }
                Err(e) => Err(e),
            };

            let results: Vec<JobResult<O>> = match outcome {
                Ok(results) => {
                    let returned = results.len();
                    let mut results: Vec<_> = results.into_iter().map(Some).collect();
                    results.resize_with(size, || None);
                    results
                        .into_iter()
                        .map(|result| {
                            result.unwrap_or_else(|| {
                                Err(Error::job_failed(format!(
                                    "batch handler returned {returned} results for {size} jobs"
                                )))
                            })
                        })
                        .collect()
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {} batch of {size} failed: {e}", ctx.id);
                    (0..size).map(|_| Err(e.clone())).collect()
                }
            };

            for ((id, reply), result) in replies.into_iter().zip(results) {
                self.metrics.job_finished(result.is_ok());
                deliver(ctx.id, &id, reply, result);
            }
        })
    }

    fn abandon(&self, batch: Batch<I, O>) -> usize {
        let count = batch.jobs.len();
        for job in batch.jobs {
            self.metrics.record_rejected();
            job.reject(Error::PoolShuttingDown);
        }
        count
    }
}

/// A bounded worker pool whose work function processes batches of jobs.
///
/// Submission, timeout and shutdown behave as for
/// [`WorkerPool`](crate::WorkerPool); the inbox in front of the accumulator
/// has the configured queue capacity.
pub struct BatchPool<I: Send + 'static, O: Send + 'static> {
    inner: Arc<BatchInner<I, O>>,
}

struct BatchInner<I: Send + 'static, O: Send + 'static> {
    engine: Engine<Batch<I, O>>,
    inbox: mpsc::Sender<Job<I, O>>,
    /// Jobs in batches waiting for a worker.
    queued: Arc<AtomicUsize>,
    accumulator: Mutex<Option<JoinHandle<usize>>>,
    backpressure: Backpressure,
    capacity: usize,
}

impl<I, O> Clone for BatchPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, O> BatchPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Starts a pool that groups jobs per `batch` and runs `handler` on each
    /// group.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either config fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<H>(config: PoolConfig, batch: BatchConfig, handler: H) -> Result<Self>
    where
        H: BatchHandler<I, O>,
    {
        Self::with_metrics(config, batch, handler, Arc::new(PoolMetrics::new()))
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if either config fails validation.
    pub fn with_metrics<H>(
        config: PoolConfig,
        batch: BatchConfig,
        handler: H,
        metrics: Arc<PoolMetrics>,
    ) -> Result<Self>
    where
        H: BatchHandler<I, O>,
    {
        batch.validate()?;

        let executor = BatchExecutor {
            handler: Arc::new(handler),
            policies: Policies::from_config(&config),
            metrics: Arc::clone(&metrics),
        };
        let queued = Arc::new(AtomicUsize::new(0));
        let (inbox, rx) = mpsc::channel(config.queue_capacity);
        let backlog: Backlog = {
            let inbox = inbox.downgrade();
            let queued = Arc::clone(&queued);
            Box::new(move || {
                let waiting = inbox.upgrade().map_or(0, |inbox| inbox_depth(&inbox));
                waiting + queued.load(Ordering::Acquire)
            })
        };
        let engine = Engine::start(&config, Arc::new(executor), metrics, Some(backlog))?;

        let accumulator = tokio::spawn(accumulate(
            rx,
            Arc::clone(engine.shared()),
            Arc::clone(&queued),
            batch,
            config.drain,
        ));

        Ok(Self {
            inner: Arc::new(BatchInner {
                engine,
                inbox,
                queued,
                accumulator: Mutex::new(Some(accumulator)),
                backpressure: config.backpressure,
                capacity: config.queue_capacity,
            }),
        })
    }

    /// Hands `job` to the accumulator without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolShuttingDown`] once shutdown has begun.
    /// - [`Error::PoolSaturated`] if the inbox is full.
    pub fn try_submit(&self, job: Job<I, O>) -> Result<()> {
        if !self.inner.engine.is_running() {
            return Err(self.rejected(Error::PoolShuttingDown));
        }
        match self.inner.inbox.try_send(job) {
            Ok(()) => {
                self.metrics_handle().record_submitted();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(self.rejected(Error::PoolSaturated {
                capacity: self.inner.capacity,
            })),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(self.rejected(Error::PoolShuttingDown))
            }
        }
    }

    /// Hands `job` to the accumulator according to the configured
    /// [`Backpressure`].
    ///
    /// # Errors
    ///
    /// Same as [`BatchPool::try_submit`]; with [`Backpressure::Block`] a full
    /// inbox is never an error.
    pub async fn submit(&self, job: Job<I, O>) -> Result<()> {
        match self.inner.backpressure {
            Backpressure::Reject => self.try_submit(job),
            Backpressure::Block => {
                if !self.inner.engine.is_running() {
                    return Err(self.rejected(Error::PoolShuttingDown));
                }
                let sent = tokio::select! {
                    biased;
                    () = self.inner.engine.token().cancelled() => false,
                    sent = self.inner.inbox.send(job) => sent.is_ok(),
                };
                if sent {
                    self.metrics_handle().record_submitted();
                    Ok(())
                } else {
                    Err(self.rejected(Error::PoolShuttingDown))
                }
            }
        }
    }

    /// Submits `job` and waits for its result, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// As for [`WorkerPool::submit_and_await`](crate::WorkerPool::submit_and_await).
    pub async fn submit_and_await(&self, mut job: Job<I, O>, timeout: Duration) -> Result<O> {
        let rx = job.reply_channel();
        let round_trip = async {
            match self.submit(job).await {
                Ok(()) => rx.await.unwrap_or(Err(Error::Abandoned)),
                Err(e) => Err(e),
            }
        };
        tokio::time::timeout(timeout, round_trip)
            .await
            .unwrap_or(Err(Error::Timeout { elapsed: timeout }))
    }

    /// Stops accepting jobs, flushes the accumulator (dispatching or rejecting
    /// its partial batch per the drain policy), then shuts the workers down.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.inner
            .engine
            .shutdown_after(|deadline| await_flush(self.inner.accumulator.lock().take(), deadline))
            .await
    }

    /// Jobs waiting in the inbox or in batches waiting for a worker.
    pub fn queue_depth(&self) -> usize {
        inbox_depth(&self.inner.inbox) + self.inner.queued.load(Ordering::Acquire)
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.inner.engine.worker_count()
    }

    pub fn workers_alive(&self) -> usize {
        self.inner.engine.workers_alive()
    }

    pub fn state(&self) -> PoolState {
        self.inner.engine.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .engine
            .snapshot(self.queue_depth(), self.queue_capacity())
    }

    pub fn metrics_handle(&self) -> &Arc<PoolMetrics> {
        self.inner.engine.metrics()
    }

    fn rejected(&self, error: Error) -> Error {
        self.metrics_handle().record_rejected();
        error
    }
}

impl<I, O> Drop for BatchInner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(accumulator) = self.accumulator.get_mut().take() {
            accumulator.abort();
        }
    }
}

/// Waits until `deadline` for the accumulator to flush. Returns how many jobs
/// it answered with `PoolShuttingDown`.
async fn await_flush(accumulator: Option<JoinHandle<usize>>, deadline: Instant) -> usize {
    let Some(mut accumulator) = accumulator else {
        return 0;
    };
    match tokio::time::timeout_at(deadline, &mut accumulator).await {
        Ok(Ok(rejected)) => rejected,
        Ok(Err(_e)) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Batch accumulator terminated abnormally: {_e}");
            0
        }
        Err(_) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Batch accumulator did not flush in time; aborting");
            accumulator.abort();
            0
        }
    }
}

/// Groups inbox jobs into batches and queues them until shutdown, then
/// flushes what is left. Returns how many jobs were answered with
/// `PoolShuttingDown` instead of being dispatched.
async fn accumulate<I, O>(
    mut inbox: mpsc::Receiver<Job<I, O>>,
    shared: Arc<Shared<Batch<I, O>>>,
    queued: Arc<AtomicUsize>,
    config: BatchConfig,
    drain: DrainPolicy,
) -> usize
where
    I: Send + 'static,
    O: Send + 'static,
{
    let token = shared.lifecycle.token().clone();
    let mut leftover = Vec::new();

    loop {
        let first = tokio::select! {
            biased;
            () = token.cancelled() => break,
            job = inbox.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let mut jobs = Vec::with_capacity(config.max_batch_size);
        jobs.push(first);
        let mut counted = Queued::add(&queued, 1);
        let deadline = Instant::now() + config.max_wait;
        while jobs.len() < config.max_batch_size {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = sleep_until(deadline) => break,
                job = inbox.recv() => match job {
                    Some(job) => {
                        jobs.push(job);
                        counted.add_one();
                    }
                    None => break,
                },
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("Dispatching batch of {}", jobs.len());

        if let Err(PushError::Full(batch) | PushError::Closed(batch)) =
            shared.queue.push(Batch { jobs, queued: counted }, 0, &token).await
        {
            leftover = batch.jobs;
            break;
        }
    }

    inbox.close();
    while let Ok(job) = inbox.try_recv() {
        leftover.push(job);
    }
    if leftover.is_empty() {
        return 0;
    }

    match drain {
        DrainPolicy::Drain => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Flushing {} batched jobs before shutdown", leftover.len());
            // Workers keep draining until the queue is closed, which happens
            // only after this task returns.
            let flush = CancellationToken::new();
            let mut rejected = 0;
            let mut rest = leftover.into_iter().peekable();
            while rest.peek().is_some() {
                let jobs: Vec<_> = rest.by_ref().take(config.max_batch_size).collect();
                if let Err(err) = shared.queue.push(Batch::new(jobs, &queued), 0, &flush).await {
                    rejected += shared.executor.abandon(err.into_inner());
                }
            }
            rejected
        }
        DrainPolicy::StopImmediately => {
            shared.executor.abandon(Batch::new(leftover, &queued))
        }
    }
}
