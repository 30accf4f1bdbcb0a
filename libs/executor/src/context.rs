//! Execution context: a worker pool plus an optional scheduler thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::ExecutorConfig;
use crate::error::ExecutorError;
use crate::pool::{Submitter, WorkerPool};
use crate::task::{with_handle, Task, TaskHandle};
use crate::timer::{PeriodicHandle, Repeat, ScheduledHandle, TimerThread};

/// Worker pool with an optional scheduler and a one-way open/closed lifecycle.
///
/// Delayed and periodic tasks are armed on the scheduler thread but always run
/// on the worker pool. After [`shutdown`](Self::shutdown) every submission
/// fails with [`ExecutorError::Shutdown`]; already queued work and armed
/// one-shot timers still run.
pub struct ExecutionContext {
    name: String,
    pool: WorkerPool,
    timer: Option<TimerThread>,
    closed: AtomicBool,
}

impl ExecutionContext {
    /// Build a context from configuration.
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        config.validate()?;

        let pool = WorkerPool::new(&config.name, config.worker_threads)?;
        let timer = if config.enable_scheduler {
            let on_exit_pool = pool.clone();
            Some(TimerThread::spawn(
                &config.name,
                Box::new(move || {
                    on_exit_pool.shutdown();
                }),
            )?)
        } else {
            None
        };

        info!(
            name = %config.name,
            worker_threads = config.worker_threads,
            scheduler = config.enable_scheduler,
            "Execution context started"
        );

        Ok(Self {
            name: config.name.clone(),
            pool,
            timer,
            closed: AtomicBool::new(false),
        })
    }

    /// Build a context with `threads` workers and no scheduler.
    pub fn with_threads(name: &str, threads: usize) -> Result<Self, ExecutorError> {
        Self::new(&ExecutorConfig {
            name: name.to_string(),
            worker_threads: threads,
            enable_scheduler: false,
        })
    }

    /// Run a task on the worker pool.
    pub fn execute<F>(&self, f: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_task(Box::new(f))
    }

    /// Run a task on the worker pool and return a handle to its result.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (task, handle) = with_handle(f);
        self.pool.execute(task)?;
        Ok(handle)
    }

    /// Run a task on the worker pool once `delay` has elapsed.
    pub fn schedule<F, T>(&self, f: F, delay: Duration) -> Result<ScheduledHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let timer = self.scheduler()?;
        let (task, handle) = with_handle(f);
        timer.schedule_once(delay, task, handle, self.pool_target())
    }

    /// Run a task every `period`, measured from the previous deadline.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<PeriodicHandle, ExecutorError>
    where
        F: FnMut() + Send + 'static,
    {
        let timer = self.scheduler()?;
        timer.schedule_periodic(
            initial_delay,
            period,
            Repeat::FixedRate,
            Box::new(f),
            self.pool_target(),
        )
    }

    /// Run a task repeatedly, waiting `delay` after each run completes.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<PeriodicHandle, ExecutorError>
    where
        F: FnMut() + Send + 'static,
    {
        let timer = self.scheduler()?;
        timer.schedule_periodic(
            initial_delay,
            delay,
            Repeat::FixedDelay,
            Box::new(f),
            self.pool_target(),
        )
    }

    /// Stop accepting work. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.name, "Execution context shutting down");
        match &self.timer {
            // The timer closes the pool once its remaining one-shot entries fired.
            Some(timer) => timer.shutdown(),
            None => {
                self.pool.shutdown();
            }
        }
    }

    /// Stop accepting work and discard everything not yet started.
    ///
    /// Returns the number of discarded tasks and timers.
    pub fn shutdown_now(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let timers = self.timer.as_ref().map_or(0, TimerThread::shutdown_now);
        let queued = self.pool.shutdown_now();
        info!(name = %self.name, discarded = timers + queued, "Execution context stopped");
        timers + queued
    }

    /// Wait until the scheduler (if any) and all worker threads have exited.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if let Some(timer) = &self.timer {
            if !timer.await_exit(deadline) {
                return false;
            }
        }
        self.pool
            .await_termination(deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.timer.as_ref().map_or(true, TimerThread::is_terminated) && self.pool.is_terminated()
    }

    pub fn has_scheduler(&self) -> bool {
        self.timer.is_some()
    }

    pub fn worker_threads(&self) -> usize {
        self.pool.threads()
    }

    /// Number of armed delayed or periodic entries.
    pub fn scheduled_count(&self) -> usize {
        self.timer.as_ref().map_or(0, TimerThread::pending)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), ExecutorError> {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown);
        }
        Ok(())
    }

    fn scheduler(&self) -> Result<&TimerThread, ExecutorError> {
        self.ensure_open()?;
        self.timer.as_ref().ok_or(ExecutorError::NoScheduler)
    }

    fn pool_target(&self) -> Arc<dyn Submitter> {
        Arc::new(self.pool.clone())
    }
}

impl Submitter for ExecutionContext {
    fn execute_task(&self, task: Task) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        self.pool.execute(task)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("scheduler", &self.timer.is_some())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
