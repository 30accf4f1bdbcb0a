//! # courier-executor
//!
//! Thread-backed execution primitives for the courier runtime.
//!
//! ## Components
//!
//! - [`ExecutionContext`]: a worker pool plus an optional timer thread, with
//!   `execute`/`submit`/`schedule*` and a one-way shutdown lifecycle
//! - [`PartitionedExecutor`]: routes each key to one of N ordered
//!   single-thread lanes; per-key submission order is execution order
//! - [`HashedTimeWheel`]: ring of time slots fired by one tick thread
//!
//! ## Threads
//!
//! Everything here runs on OS threads. Blocking waits go through
//! `parking_lot` condition variables; task results are delivered through
//! [`TaskHandle`], which can be joined from blocking code or awaited.
//!
//! Delayed and periodic tasks are armed on the timer thread but always run on
//! worker threads, so a slow task never delays other timers.

mod clock;
mod config;
mod context;
mod error;
mod partition;
mod pool;
mod queue;
mod task;
mod timer;
mod wheel;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ExecutorConfig, PartitionConfig};
pub use context::ExecutionContext;
pub use error::ExecutorError;
pub use partition::{
    partitioner_fn, FnPartitioner, HashPartitioner, PartitionedExecutor, Partitioner,
    ResizePolicy,
};
pub use pool::{Submitter, WorkerPool};
pub use queue::TaskQueue;
pub use task::{panic_message, run_catching, Task, TaskHandle};
pub use timer::{PeriodicHandle, Repeat, ScheduledHandle};
pub use wheel::{HashedTimeWheel, TimerEntry, TimerId, WheelConfig};
