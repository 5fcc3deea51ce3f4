//! Generic elastic worker pool.
//!
//! A [`WorkerPool`] runs typed tasks through registered [`TaskHandler`]s with
//! a priority queue, per-attempt timeouts, retry budgets, worker recycling,
//! and idle reaping. The orchestrator uses it to back in-process execution
//! units; it is also usable on its own.

pub mod config;
pub mod pool;
pub mod task;
pub mod worker;

pub use config::WorkerPoolConfig;
pub use pool::{PoolStats, WorkerPool};
pub use task::{handler_fn, FnHandler, PoolTask, PoolTaskStatus, SubmitOptions, TaskHandler, TaskInput};
pub use worker::{WorkerInfo, WorkerStatus};
