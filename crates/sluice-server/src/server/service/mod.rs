//! HTTP surface of the server.
//!
//! Every request to `/` becomes one job on the shared
//! [`WorkerPool`](sluice::WorkerPool); the remaining routes only read
//! counters.
//!
//! ## Structure
//!
//! - [`handler`] - routes, shared state and the error-to-status mapping.
//! - [`work`] - the work function run by each worker.

pub mod handler;
pub mod work;
