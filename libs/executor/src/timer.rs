//! Dedicated scheduler thread backed by a deadline-ordered heap.
//!
//! The timer thread never runs user code. When an entry comes due it is handed
//! to the entry's target [`Submitter`] (a worker pool or a partition lane), so
//! timer precision does not depend on how long tasks take.
//!
//! Periodic entries are re-armed by the worker after each run completes, which
//! means two runs of the same periodic task never overlap. A periodic run that
//! panics is not re-armed.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::error::ExecutorError;
use crate::pool::Submitter;
use crate::task::{run_catching, Task, TaskHandle};

const PENDING: u8 = 0;
const DONE: u8 = 1;
const CANCELLED: u8 = 2;

/// How a periodic task computes its next deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Next deadline is the previous deadline plus the period.
    FixedRate,
    /// Next deadline is the completion time of the previous run plus the delay.
    FixedDelay,
}

pub(crate) type PeriodicJob = Box<dyn FnMut() + Send + 'static>;

enum Work {
    Once(Mutex<Option<Task>>),
    Periodic {
        job: Mutex<PeriodicJob>,
        repeat: Repeat,
        period: Duration,
    },
}

/// An entry owned by the timer heap (and by its handle).
pub(crate) struct DelayedTask {
    id: u64,
    state: AtomicU8,
    runs: AtomicU64,
    work: Work,
    target: Arc<dyn Submitter>,
}

impl DelayedTask {
    fn is_periodic(&self) -> bool {
        matches!(self.work, Work::Periodic { .. })
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    fn finish(&self) {
        let _ = self
            .state
            .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire);
    }

    /// Flag the entry cancelled. Returns true if it had not finished yet.
    fn mark_cancelled(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Work::Once(task) = &self.work {
            // Dropping the closure drops its result sender.
            task.lock().take();
        }
        true
    }
}

struct Armed {
    deadline: Instant,
    seq: u64,
    task: Arc<DelayedTask>,
}

impl PartialEq for Armed {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Armed {}

impl PartialOrd for Armed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Armed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct TimerState {
    heap: BinaryHeap<Reverse<Armed>>,
    shutdown: bool,
    exited: bool,
}

pub(crate) struct TimerShared {
    name: String,
    state: Mutex<TimerState>,
    wakeup: Condvar,
    exited: Condvar,
    next_seq: AtomicU64,
}

impl TimerShared {
    fn arm(&self, deadline: Instant, task: Arc<DelayedTask>) -> Result<(), ExecutorError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(ExecutorError::Shutdown);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        state.heap.push(Reverse(Armed {
            deadline,
            seq,
            task,
        }));
        drop(state);
        self.wakeup.notify_one();
        Ok(())
    }

    fn remove(&self, id: u64) {
        self.state.lock().heap.retain(|Reverse(armed)| armed.task.id != id);
    }
}

/// The scheduler thread of an execution context or partitioned executor.
pub(crate) struct TimerThread {
    shared: Arc<TimerShared>,
}

impl TimerThread {
    /// Spawn the timer thread. `on_exit` runs on the timer thread after it
    /// has been shut down and every remaining one-shot entry has fired.
    pub(crate) fn spawn(
        name: &str,
        on_exit: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<Self, ExecutorError> {
        let shared = Arc::new(TimerShared {
            name: name.to_string(),
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                shutdown: false,
                exited: false,
            }),
            wakeup: Condvar::new(),
            exited: Condvar::new(),
            next_seq: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || timer_loop(worker, on_exit))
            .map_err(|e| {
                ExecutorError::InvalidConfig(format!("failed to spawn timer thread: {e}"))
            })?;

        Ok(Self { shared })
    }

    /// Arm a one-shot entry whose `task` is handed to `target` after `delay`.
    pub(crate) fn schedule_once<T>(
        &self,
        delay: Duration,
        task: Task,
        result: TaskHandle<T>,
        target: Arc<dyn Submitter>,
    ) -> Result<ScheduledHandle<T>, ExecutorError> {
        let entry = Arc::new(DelayedTask {
            id: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(PENDING),
            runs: AtomicU64::new(0),
            work: Work::Once(Mutex::new(Some(task))),
            target,
        });
        self.shared
            .arm(Instant::now() + delay, Arc::clone(&entry))?;
        Ok(ScheduledHandle {
            entry,
            timer: Arc::downgrade(&self.shared),
            result,
        })
    }

    /// Arm a periodic entry.
    pub(crate) fn schedule_periodic(
        &self,
        initial_delay: Duration,
        period: Duration,
        repeat: Repeat,
        job: PeriodicJob,
        target: Arc<dyn Submitter>,
    ) -> Result<PeriodicHandle, ExecutorError> {
        if period.is_zero() {
            return Err(ExecutorError::InvalidConfig(
                "period must be greater than zero".to_string(),
            ));
        }
        let entry = Arc::new(DelayedTask {
            id: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(PENDING),
            runs: AtomicU64::new(0),
            work: Work::Periodic {
                job: Mutex::new(job),
                repeat,
                period,
            },
            target,
        });
        self.shared
            .arm(Instant::now() + initial_delay, Arc::clone(&entry))?;
        Ok(PeriodicHandle {
            entry,
            timer: Arc::downgrade(&self.shared),
        })
    }

    /// Stop accepting entries and drop periodic ones; armed one-shot entries
    /// still fire.
    pub(crate) fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        state.heap.retain(|Reverse(armed)| {
            if armed.task.is_periodic() {
                armed.task.mark_cancelled();
                false
            } else {
                true
            }
        });
        drop(state);
        debug!(timer = %self.shared.name, "Timer shutting down");
        self.shared.wakeup.notify_all();
    }

    /// Stop accepting entries and cancel everything still armed.
    pub(crate) fn shutdown_now(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        let discarded: Vec<_> = state.heap.drain().collect();
        drop(state);
        for Reverse(armed) in &discarded {
            armed.task.mark_cancelled();
        }
        self.shared.wakeup.notify_all();
        discarded.len()
    }

    /// Wait for the timer thread to exit.
    pub(crate) fn await_exit(&self, deadline: Instant) -> bool {
        let mut state = self.shared.state.lock();
        while !state.exited {
            if self
                .shared
                .exited
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.exited;
            }
        }
        true
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.shared.state.lock().exited
    }

    /// Number of armed entries.
    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>, on_exit: Box<dyn FnOnce() + Send + 'static>) {
    let mut state = shared.state.lock();
    loop {
        let next_deadline = state.heap.peek().map(|Reverse(armed)| armed.deadline);
        match next_deadline {
            Some(deadline) if deadline <= Instant::now() => {
                if let Some(Reverse(armed)) = state.heap.pop() {
                    MutexGuard::unlocked(&mut state, || fire(&shared, armed));
                }
            }
            Some(deadline) => {
                shared.wakeup.wait_until(&mut state, deadline);
            }
            None if state.shutdown => break,
            None => shared.wakeup.wait(&mut state),
        }
    }
    drop(state);

    on_exit();

    let mut state = shared.state.lock();
    state.exited = true;
    drop(state);
    shared.exited.notify_all();
    debug!(timer = %shared.name, "Timer thread exited");
}

fn fire(shared: &Arc<TimerShared>, armed: Armed) {
    let entry = armed.task;
    match &entry.work {
        Work::Once(task) => {
            if entry
                .state
                .compare_exchange(PENDING, DONE, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let Some(task) = task.lock().take() else {
                return;
            };
            entry.runs.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = entry.target.execute_task(task) {
                warn!(timer = %shared.name, error = %e, "Dropping delayed task, target rejected it");
            }
        }
        Work::Periodic { .. } => {
            if entry.state.load(Ordering::Acquire) != PENDING {
                return;
            }
            let run = periodic_run(Arc::downgrade(shared), Arc::clone(&entry), armed.deadline);
            if let Err(e) = entry.target.execute_task(run) {
                warn!(timer = %shared.name, error = %e, "Stopping periodic task, target rejected it");
                entry.finish();
            }
        }
    }
}

fn periodic_run(timer: Weak<TimerShared>, entry: Arc<DelayedTask>, deadline: Instant) -> Task {
    Box::new(move || {
        let Work::Periodic {
            job,
            repeat,
            period,
        } = &entry.work
        else {
            return;
        };
        if entry.is_cancelled() {
            return;
        }

        let outcome = run_catching(|| {
            let mut job = job.lock();
            (&mut **job)()
        });
        entry.runs.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = outcome {
            error!(error = %e, "Periodic task failed, not rescheduling");
            entry.finish();
            return;
        }
        if entry.is_cancelled() {
            return;
        }

        let next = match repeat {
            Repeat::FixedRate => deadline + *period,
            Repeat::FixedDelay => Instant::now() + *period,
        };
        let rearmed = match timer.upgrade() {
            Some(timer) => timer.arm(next, Arc::clone(&entry)).is_ok(),
            None => false,
        };
        if !rearmed {
            entry.finish();
        }
    })
}

/// Handle to a delayed one-shot task.
#[must_use = "dropping a ScheduledHandle discards the task's result"]
pub struct ScheduledHandle<T> {
    entry: Arc<DelayedTask>,
    timer: Weak<TimerShared>,
    result: TaskHandle<T>,
}

impl<T> ScheduledHandle<T> {
    /// Cancel the task if it has not been handed to a worker yet.
    pub fn cancel(&self) -> bool {
        if !self.entry.mark_cancelled() {
            return false;
        }
        if let Some(timer) = self.timer.upgrade() {
            timer.remove(self.entry.id);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }

    /// Block until the task has run (or was cancelled).
    pub fn join(self) -> Result<T, ExecutorError> {
        self.result.join()
    }
}

impl<T> Future for ScheduledHandle<T> {
    type Output = Result<T, ExecutorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().result).poll(cx)
    }
}

/// Handle to a periodic task.
pub struct PeriodicHandle {
    entry: Arc<DelayedTask>,
    timer: Weak<TimerShared>,
}

impl PeriodicHandle {
    /// Stop future runs. A run already in progress completes.
    pub fn cancel(&self) -> bool {
        if !self.entry.mark_cancelled() {
            return false;
        }
        if let Some(timer) = self.timer.upgrade() {
            timer.remove(self.entry.id);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }

    /// True once the task will never run again.
    pub fn is_done(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) != PENDING
    }

    /// Number of runs started so far.
    pub fn run_count(&self) -> u64 {
        self.entry.runs.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PeriodicHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicHandle")
            .field("id", &self.entry.id)
            .field("runs", &self.run_count())
            .field("done", &self.is_done())
            .finish()
    }
}
