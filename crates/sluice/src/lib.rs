#![doc = include_str!("../README.md")]

mod config;
mod error;
mod job;
mod lifecycle;
mod metrics;
mod policy;
mod pool;
mod queue;

pub use crate::config::*;
pub use crate::error::*;
pub use crate::job::*;
pub use crate::lifecycle::*;
pub use crate::metrics::*;
pub use crate::policy::*;
pub use crate::pool::*;
pub use crate::queue::*;
