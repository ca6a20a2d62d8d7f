#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Executes large numbers of independent, CPU-bound tasks on a bounded pool of worker threads or
//! worker processes.
//!
//! The caller builds a batch of tasks, the pool splits it into chunks and its workers pull the
//! chunks from a shared queue until none are left. Results come back in submission order, tagged
//! with the worker that produced them.
//!
//! # Quick start
//!
//! ```
//! use many_tasks::{ExecutionMode, Reducer, WorkerPool, from_fn};
//!
//! let mut pool = WorkerPool::builder()
//!     .workers(4)
//!     .mode(ExecutionMode::Thread)
//!     .build()
//!     .unwrap();
//!
//! let tasks = (1..=1000_u64).map(|i| from_fn(move || Ok(i))).collect();
//! let results = pool.execute(tasks, 50).unwrap();
//!
//! let total = Reducer::sum().reduce(results.into_values().unwrap());
//! assert_eq!(total, Some(500_500));
//! ```
//!
//! # Chunking
//!
//! Handing a chunk to a worker has a fixed cost. With a chunk size of 1, every task pays that
//! cost; with a chunk size of 100, a hundred tasks share it. Larger chunks are not always better:
//! once the queue is empty, workers that finished early sit idle while the others work through
//! their last big chunk. [`DispatchStats`] reports the number of dispatch events per batch.
//!
//! # Execution modes
//!
//! In [`ExecutionMode::Thread`], workers are threads sharing the caller's memory. By default, task
//! code on these threads runs under a pool-wide exclusivity lock, so CPU-bound tasks do not run
//! any faster than they would sequentially. Code that can safely run concurrently opts out of the
//! lock by wrapping itself in [`parallel_section()`]. The lock can also be disabled for the whole
//! pool with [`PoolBuilder::global_lock()`].
//!
//! In [`ExecutionMode::Process`] (unix only), every batch is executed by worker processes forked
//! from the caller. They run truly in parallel but everything they change in ordinary memory stays
//! inside the worker process that changed it. Their outputs travel back to the caller as JSON, so
//! [`WorkerPool::execute()`] requires serializable outputs. Thread mode pools also offer
//! [`WorkerPool::execute_shared()`], which accepts outputs of any type.
//!
//! # Sharing state
//!
//! There are two ways to combine the work of many tasks:
//!
//! * **Shared mutable state**: [`SharedCounter`] and [`SharedStore`] live in memory that is shared
//!   with worker processes and are updated under mutual exclusion (or atomically), so no update is
//!   lost in either mode. Contention on them is the price.
//! * **Copy, then reduce**: every task returns its partial result, for example a [`Tally`], and
//!   the caller combines them with a [`Reducer`] or [`tally()`] after the batch. No task waits for
//!   another.
//!
//! [`RacyCounter`] shows what goes wrong without either.
//!
//! # Failures
//!
//! Tasks report failures by returning a [`TaskError`]; panics are captured and reported the same
//! way. Under [`FailurePolicy::Isolate`] every task runs and failures are reported next to the
//! successful results. Under [`FailurePolicy::FailFast`] the first failure stops the batch and
//! the call returns with partial results.

mod cancellation;
mod chunk;
mod config;
mod error;
mod exclusivity;
#[cfg(unix)]
mod frame;
mod pool;
#[cfg(unix)]
mod process_workers;
mod race;
mod reduce;
mod results;
mod shared_counter;
mod shared_region;
mod shared_store;
mod task;
mod thread_workers;
mod worker_id;

pub use cancellation::*;
pub use chunk::*;
pub use config::*;
pub use error::*;
pub use exclusivity::parallel_section;
pub use pool::*;
pub use race::*;
pub use reduce::*;
pub use results::{BatchResults, DispatchStats, TaskResult};
pub use shared_counter::*;
pub use shared_store::*;
pub use task::{FnTask, Task, from_fn};
pub use worker_id::*;
