//! Fixed-size pool of worker threads draining a shared task queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::ExecutorError;
use crate::queue::TaskQueue;
use crate::task::{run_catching, Task};

/// Something that accepts fire-and-forget tasks.
pub trait Submitter: Send + Sync {
    /// Queue a task for execution.
    fn execute_task(&self, task: Task) -> Result<(), ExecutorError>;
}

/// A fixed number of OS threads pulling tasks from one FIFO queue.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    name: String,
    threads: usize,
    queue: TaskQueue<Task>,
    live_threads: Mutex<usize>,
    terminated: Condvar,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerPool {
    /// Spawn a pool with `threads` workers named `{name}-{index}`.
    pub fn new(name: &str, threads: usize) -> Result<Self, ExecutorError> {
        if threads == 0 {
            return Err(ExecutorError::InvalidConfig(
                "worker pool needs at least one thread".to_string(),
            ));
        }

        let inner = Arc::new(PoolInner {
            name: name.to_string(),
            threads,
            queue: TaskQueue::new(),
            live_threads: Mutex::new(0),
            terminated: Condvar::new(),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        for index in 0..threads {
            *inner.live_threads.lock() += 1;
            let worker = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(worker));

            if let Err(e) = spawned {
                *inner.live_threads.lock() -= 1;
                inner.queue.close();
                return Err(ExecutorError::InvalidConfig(format!(
                    "failed to spawn worker thread: {e}"
                )));
            }
        }

        debug!(pool = %name, threads, "Worker pool started");
        Ok(Self { inner })
    }

    /// Queue a task. Fails once the pool has been shut down.
    pub fn execute(&self, task: Task) -> Result<(), ExecutorError> {
        self.inner
            .queue
            .push(task)
            .map_err(|_| ExecutorError::Shutdown)
    }

    /// Stop accepting tasks; already queued tasks still run.
    ///
    /// Returns false if the pool was already shut down.
    pub fn shutdown(&self) -> bool {
        let first = self.inner.queue.close();
        if first {
            debug!(pool = %self.inner.name, "Worker pool shutting down");
        }
        first
    }

    /// Stop accepting tasks and discard the ones not yet started.
    ///
    /// Returns the number of discarded tasks.
    pub fn shutdown_now(&self) -> usize {
        self.inner.queue.close();
        self.inner.queue.drain().len()
    }

    /// Wait until every worker thread has exited.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.inner.live_threads.lock();
        while *live > 0 {
            if self
                .inner
                .terminated
                .wait_until(&mut live, deadline)
                .timed_out()
            {
                return *live == 0;
            }
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.is_closed()
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.live_threads.lock() == 0
    }

    /// Configured number of worker threads.
    pub fn threads(&self) -> usize {
        self.inner.threads
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    /// Number of tasks that ran to completion (panicked tasks excluded).
    pub fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    /// Number of tasks that panicked.
    pub fn panicked(&self) -> u64 {
        self.inner.panicked.load(Ordering::Relaxed)
    }
}

impl Submitter for WorkerPool {
    fn execute_task(&self, task: Task) -> Result<(), ExecutorError> {
        self.execute(task)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("threads", &self.inner.threads)
            .field("queued", &self.queued())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    while let Some(task) = inner.queue.take() {
        match run_catching(task) {
            Ok(()) => {
                inner.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                inner.panicked.fetch_add(1, Ordering::Relaxed);
                error!(pool = %inner.name, error = %e, "Worker task panicked");
            }
        }
    }

    let mut live = inner.live_threads.lock();
    *live -= 1;
    if *live == 0 {
        debug!(pool = %inner.name, "Worker pool terminated");
        inner.terminated.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_rejects_zero_threads() {
        assert!(matches!(
            WorkerPool::new("empty", 0),
            Err(ExecutorError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_runs_tasks_and_drains_on_shutdown() {
        let pool = WorkerPool::new("drain", 2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }

        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.completed(), 100);
    }

    #[test]
    fn test_execute_after_shutdown_is_rejected() {
        let pool = WorkerPool::new("closed", 1).unwrap();
        pool.shutdown();
        let result = pool.execute(Box::new(|| {}));
        assert_eq!(result, Err(ExecutorError::Shutdown));
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("panic", 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(Box::new(|| panic!("task failure"))).unwrap();
        let after = Arc::clone(&counter);
        pool.execute(Box::new(move || {
            after.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.panicked(), 1);
    }

    #[test]
    fn test_shutdown_now_discards_queued() {
        let pool = WorkerPool::new("now", 1).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        pool.execute(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .unwrap();
        started_rx.recv().unwrap();

        for _ in 0..3 {
            pool.execute(Box::new(|| {})).unwrap();
        }

        assert_eq!(pool.shutdown_now(), 3);
        release_tx.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
    }

    #[test]
    fn test_await_termination_times_out_while_busy() {
        let pool = WorkerPool::new("busy", 1).unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        pool.execute(Box::new(move || {
            let _ = release_rx.recv();
        }))
        .unwrap();
        pool.shutdown();

        assert!(!pool.await_termination(Duration::from_millis(50)));
        release_tx.send(()).unwrap();
        assert!(pool.await_termination(Duration::from_secs(5)));
        assert!(pool.is_terminated());
    }
}
