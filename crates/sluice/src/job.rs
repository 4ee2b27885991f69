//! Units of work and their outcomes.
//!
//! A [`Job`] carries an opaque input, an identifier, a priority (only
//! consulted by [`QueueDiscipline::Priority`]) and an optional one-shot result
//! channel owned by the submitter. The channel is a [`oneshot`] sender, so at
//! most one [`JobResult`] can ever be written and the writer never blocks.
//!
//! Work functions implement [`Handler`] (one job at a time) or
//! [`BatchHandler`] (a batch of jobs). Both are implemented for async
//! closures, so most callers never name the traits.
//!
//! [`QueueDiscipline::Priority`]: crate::QueueDiscipline::Priority

use crate::error::{Error, Result};
use core::fmt;
use core::future::Future;
use futures::future::BoxFuture;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;

/// The outcome of executing a [`Job`]: either the output value or the error
/// that explains why there is none.
pub type JobResult<O> = Result<O>;

/// Caller-supplied scheduling priority. Higher values run first under the
/// priority discipline.
pub type Priority = i32;

/// Identifier attached to a job, assigned by the caller or generated from the
/// submission time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates an identifier from the current wall-clock time in
    /// nanoseconds since the Unix epoch.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        Self(nanos.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

/// A unit of submitted work.
pub struct Job<I, O> {
    id: JobId,
    priority: Priority,
    input: I,
    reply: Option<oneshot::Sender<JobResult<O>>>,
}

impl<I, O> Job<I, O> {
    /// Creates a job with a generated id, priority `0` and no result channel.
    pub fn new(input: I) -> Self {
        Self {
            id: JobId::generate(),
            priority: 0,
            input,
            reply: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches an existing result sender, replacing any previous one.
    #[must_use]
    pub fn with_reply(mut self, reply: oneshot::Sender<JobResult<O>>) -> Self {
        self.reply = Some(reply);
        self
    }

    /// Attaches a fresh result channel and returns its receiving half.
    pub fn reply_channel(&mut self) -> oneshot::Receiver<JobResult<O>> {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        rx
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub const fn priority(&self) -> Priority {
        self.priority
    }

    pub const fn input(&self) -> &I {
        &self.input
    }

    pub const fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    pub(crate) fn into_parts(self) -> (JobId, I, Option<oneshot::Sender<JobResult<O>>>) {
        (self.id, self.input, self.reply)
    }

    /// Answers the job with `error` without running it.
    pub(crate) fn reject(self, error: Error) {
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(error));
        }
    }
}

impl<I, O> fmt::Debug for Job<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("has_reply", &self.reply.is_some())
            .finish_non_exhaustive()
    }
}

/// A work function executed by a worker for a single job.
pub trait Handler<I, O>: Send + Sync + 'static {
    fn call(&self, id: JobId, input: I) -> BoxFuture<'static, JobResult<O>>;
}

impl<I, O, F, Fut> Handler<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(JobId, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<O>> + Send + 'static,
{
    fn call(&self, id: JobId, input: I) -> BoxFuture<'static, JobResult<O>> {
        Box::pin(self(id, input))
    }
}

/// A work function executed by a worker for a whole batch.
///
/// The returned vector must hold one result per input, in input order. Missing
/// results are reported to the affected jobs as [`Error::JobFailed`].
pub trait BatchHandler<I, O>: Send + Sync + 'static {
    fn call(&self, batch: Vec<(JobId, I)>) -> BoxFuture<'static, Vec<JobResult<O>>>;
}

impl<I, O, F, Fut> BatchHandler<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<(JobId, I)>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<JobResult<O>>> + Send + 'static,
{
    fn call(&self, batch: Vec<(JobId, I)>) -> BoxFuture<'static, Vec<JobResult<O>>> {
        Box::pin(self(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_numeric_timestamps() {
        let id = JobId::generate();
        assert!(id.as_str().parse::<u128>().is_ok());
    }

    #[test]
    fn builder_sets_fields() {
        let job: Job<&str, ()> = Job::new("payload").with_id("req-1").with_priority(7);
        assert_eq!(job.id().as_str(), "req-1");
        assert_eq!(job.priority(), 7);
        assert_eq!(*job.input(), "payload");
        assert!(!job.has_reply());
    }

    #[tokio::test]
    async fn reject_answers_the_reply_channel() {
        let mut job: Job<u32, u32> = Job::new(1);
        let rx = job.reply_channel();
        job.reject(Error::PoolShuttingDown);
        assert_eq!(rx.await.unwrap(), Err(Error::PoolShuttingDown));
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |id: JobId, n: u32| async move {
            assert_eq!(id.as_str(), "x");
            Ok::<_, Error>(n * 2)
        };
        let out = Handler::call(&handler, JobId::from("x"), 21).await;
        assert_eq!(out, Ok(42));
    }
}
