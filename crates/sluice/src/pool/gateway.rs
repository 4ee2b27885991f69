use crate::config::{Backpressure, PoolConfig};
use crate::error::{Error, Result};
use crate::job::{Handler, Job};
use crate::lifecycle::{PoolState, ShutdownReport};
use crate::metrics::{MetricsSnapshot, PoolMetrics};
use crate::policy::{CircuitBreaker, CircuitState, Policies};
use crate::pool::engine::Engine;
use crate::pool::worker::{Execute, WorkerContext, catch_panic, deliver};
use crate::queue::PushError;
use core::time::Duration;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Runs single jobs through the admission policies and the handler.
struct JobExecutor<I, O> {
    handler: Arc<dyn Handler<I, O>>,
    policies: Policies,
    metrics: Arc<PoolMetrics>,
}

impl<I, O> Execute<Job<I, O>> for JobExecutor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn execute<'a>(&'a self, ctx: &'a WorkerContext, job: Job<I, O>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let (id, input, reply) = job.into_parts();
            let _active = self.metrics.jobs_started(1);

            let outcome = match self.policies.admit(&ctx.token).await {
                Ok(permit) => {
                    let handler = &self.handler;
                    let job_id = id.clone();
                    let outcome = catch_panic(async move { handler.call(job_id, input).await })
                        .await
                        .and_then(core::convert::identity);
                    if let Some(permit) = permit {
                        permit.record(outcome.is_ok());
                    }
                    outcome
                }
                Err(e) => Err(e),
            };

            #[cfg(feature = "tracing")]
            if let Err(e) = &outcome {
                tracing::debug!("Worker {} job {} failed: {e}", ctx.id, id);
            }

            self.metrics.job_finished(outcome.is_ok());
            deliver(ctx.id, &id, reply, outcome);
        })
    }

    fn abandon(&self, job: Job<I, O>) -> usize {
        self.metrics.record_rejected();
        job.reject(Error::PoolShuttingDown);
        1
    }
}

/// A bounded worker pool executing jobs with a single work function.
///
/// Cloning is cheap; every clone submits to the same workers. The pool stops
/// when [`WorkerPool::shutdown`] is called or the last clone is dropped.
///
/// ```no_run
/// use core::time::Duration;
/// use sluice::{Job, JobId, PoolConfig, WorkerPool};
///
/// # async fn run() -> sluice::Result<()> {
/// let pool = WorkerPool::new(PoolConfig::new(4), |_id: JobId, n: u64| async move {
///     Ok::<_, sluice::Error>(n * 2)
/// })?;
/// let doubled = pool.submit_and_await(Job::new(21), Duration::from_secs(1)).await?;
/// assert_eq!(doubled, 42);
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerPool<I: Send + 'static, O: Send + 'static> {
    engine: Arc<Engine<Job<I, O>>>,
    breaker: Option<Arc<CircuitBreaker>>,
    backpressure: Backpressure,
}

impl<I, O> Clone for WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            breaker: self.breaker.clone(),
            backpressure: self.backpressure,
        }
    }
}

impl<I, O> WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Starts a pool running `handler` on every job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new<H>(config: PoolConfig, handler: H) -> Result<Self>
    where
        H: Handler<I, O>,
    {
        Self::with_metrics(config, handler, Arc::new(PoolMetrics::new()))
    }

    /// Like [`WorkerPool::new`], recording into caller-supplied counters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` fails validation.
    pub fn with_metrics<H>(config: PoolConfig, handler: H, metrics: Arc<PoolMetrics>) -> Result<Self>
    where
        H: Handler<I, O>,
    {
        let policies = Policies::from_config(&config);
        let breaker = policies.breaker().cloned();
        let executor = JobExecutor {
            handler: Arc::new(handler),
            policies,
            metrics: Arc::clone(&metrics),
        };
        let engine = Engine::start(&config, Arc::new(executor), metrics, None)?;
        Ok(Self {
            engine: Arc::new(engine),
            breaker,
            backpressure: config.backpressure,
        })
    }

    /// Enqueues `job` without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolShuttingDown`] once shutdown has begun.
    /// - [`Error::PoolSaturated`] if the queue is full.
    pub fn try_submit(&self, job: Job<I, O>) -> Result<()> {
        if !self.engine.is_running() {
            return Err(self.rejected(Error::PoolShuttingDown));
        }
        let priority = job.priority();
        match self.engine.queue().try_push(job, priority) {
            Ok(()) => {
                self.engine.metrics().record_submitted();
                Ok(())
            }
            Err(PushError::Full(_job)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Rejected job {}: queue full", _job.id());
                Err(self.rejected(Error::PoolSaturated {
                    capacity: self.queue_capacity(),
                }))
            }
            Err(PushError::Closed(_)) => Err(self.rejected(Error::PoolShuttingDown)),
        }
    }

    /// Enqueues `job` according to the configured [`Backpressure`]: fail fast
    /// when full, or wait for space until the pool shuts down.
    ///
    /// # Errors
    ///
    /// Same as [`WorkerPool::try_submit`]; with [`Backpressure::Block`] a full
    /// queue is never an error.
    pub async fn submit(&self, job: Job<I, O>) -> Result<()> {
        match self.backpressure {
            Backpressure::Reject => self.try_submit(job),
            Backpressure::Block => {
                if !self.engine.is_running() {
                    return Err(self.rejected(Error::PoolShuttingDown));
                }
                let priority = job.priority();
                match self.engine.queue().push(job, priority, self.engine.token()).await {
                    Ok(()) => {
                        self.engine.metrics().record_submitted();
                        Ok(())
                    }
                    Err(PushError::Full(_)) => Err(self.rejected(Error::PoolSaturated {
                        capacity: self.queue_capacity(),
                    })),
                    Err(PushError::Closed(_)) => Err(self.rejected(Error::PoolShuttingDown)),
                }
            }
        }
    }

    /// Submits `job` and waits for its result, the whole operation bounded by
    /// `timeout`.
    ///
    /// A timed-out job is not cancelled. Its worker may still run it and write
    /// the result into a channel nobody reads any more.
    ///
    /// # Errors
    ///
    /// - Any submission error from [`WorkerPool::submit`].
    /// - [`Error::Timeout`] if no result arrived in time.
    /// - [`Error::Abandoned`] if the job was dropped without a result.
    /// - The job's own failure ([`Error::JobFailed`], [`Error::WorkerPanic`],
    ///   [`Error::RateLimited`], [`Error::CircuitOpen`]).
    pub async fn submit_and_await(&self, mut job: Job<I, O>, timeout: Duration) -> Result<O> {
        let rx = job.reply_channel();
        let round_trip = async {
            match self.submit(job).await {
                Ok(()) => rx.await.unwrap_or(Err(Error::Abandoned)),
                Err(e) => Err(e),
            }
        };
        match tokio::time::timeout(timeout, round_trip).await {
            Ok(outcome) => outcome,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Job timed out after {timeout:?}");
                Err(Error::Timeout { elapsed: timeout })
            }
        }
    }

    /// Stops the pool. See [`ShutdownReport`] for what is reported.
    ///
    /// Safe to call from several tasks at once; all of them return the same
    /// report.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.engine.shutdown().await
    }

    pub fn queue_depth(&self) -> usize {
        self.engine.queue().len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.engine.queue().capacity()
    }

    /// Workers currently registered with the pool.
    pub fn worker_count(&self) -> usize {
        self.engine.worker_count()
    }

    /// Worker tasks that have not exited yet, including retired workers
    /// finishing their last job.
    pub fn workers_alive(&self) -> usize {
        self.engine.workers_alive()
    }

    pub fn state(&self) -> PoolState {
        self.engine.state()
    }

    /// `None` when no circuit breaker is configured.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(|breaker| breaker.state())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.snapshot(self.queue_depth(), self.queue_capacity())
    }

    pub fn metrics_handle(&self) -> &Arc<PoolMetrics> {
        self.engine.metrics()
    }

    fn rejected(&self, error: Error) -> Error {
        self.engine.metrics().record_rejected();
        error
    }
}

impl<I, O> core::fmt::Debug for WorkerPool<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("state", &self.state())
            .field("workers", &self.worker_count())
            .field("queue_depth", &self.queue_depth())
            .field("queue_capacity", &self.queue_capacity())
            .finish_non_exhaustive()
    }
}
