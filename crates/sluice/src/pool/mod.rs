//! Worker pools.
//!
//! - [`WorkerPool`]: one job per work-function call.
//! - [`BatchPool`]: jobs grouped into batches before execution.
//!
//! Both are thin gateways over a shared engine that owns the bounded queue,
//! the worker tasks and the lifecycle. Workers pull from the queue, run the
//! admission policies (rate limit, circuit breaker), execute the work function
//! with panic isolation and write exactly one result per job.

mod adaptive;
mod batch;
mod engine;
mod gateway;
mod worker;

pub use batch::BatchPool;
pub use gateway::WorkerPool;
