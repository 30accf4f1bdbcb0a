//! Key-partitioned executor built from single-thread ordered lanes.
//!
//! Every key maps to exactly one lane per call through a [`Partitioner`], so
//! tasks submitted for the same key run in submission order on one thread.
//! Tasks for keys on different lanes run concurrently with no ordering
//! relation.
//!
//! Resizing changes the lane count, which remaps keys. With
//! [`ResizePolicy::Reorder`] a shrink resubmits the evicted lanes' queued
//! tasks through normal routing, so they can land behind tasks already queued
//! on their new lane. [`ResizePolicy::Quiesce`] instead blocks submissions and
//! waits for every lane to go idle before switching topology.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::PartitionConfig;
use crate::error::ExecutorError;
use crate::pool::Submitter;
use crate::queue::TaskQueue;
use crate::task::{run_catching, with_handle, Task, TaskHandle};
use crate::timer::{PeriodicHandle, Repeat, ScheduledHandle, TimerThread};

// =============================================================================
// Partitioners
// =============================================================================

/// Maps a key onto one of `partitions` lanes.
///
/// Called once per submission, so implementations may keep state. Results
/// outside `0..partitions` are reduced modulo `partitions`.
pub trait Partitioner<K: ?Sized>: Send + Sync {
    fn to_partition(&self, key: &K, partitions: usize) -> usize;
}

/// Default partitioner: `hash(key) mod partitions`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashPartitioner;

impl<K: Hash + ?Sized> Partitioner<K> for HashPartitioner {
    fn to_partition(&self, key: &K, partitions: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions as u64) as usize
    }
}

/// Partitioner backed by a closure.
pub struct FnPartitioner<F>(F);

/// Wrap a closure as a [`Partitioner`].
pub fn partitioner_fn<K, F>(f: F) -> FnPartitioner<F>
where
    K: ?Sized,
    F: Fn(&K, usize) -> usize + Send + Sync,
{
    FnPartitioner(f)
}

impl<K, F> Partitioner<K> for FnPartitioner<F>
where
    K: ?Sized,
    F: Fn(&K, usize) -> usize + Send + Sync,
{
    fn to_partition(&self, key: &K, partitions: usize) -> usize {
        (self.0)(key, partitions)
    }
}

/// What a resize does to tasks already queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResizePolicy {
    /// Resize immediately; evicted tasks are resubmitted and may be reordered.
    #[default]
    Reorder,
    /// Block submissions and wait for all lanes to go idle before resizing.
    Quiesce,
}

impl FromStr for ResizePolicy {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reorder" => Ok(Self::Reorder),
            "quiesce" => Ok(Self::Quiesce),
            other => Err(ExecutorError::InvalidConfig(format!(
                "unknown resize policy '{other}' (expected 'reorder' or 'quiesce')"
            ))),
        }
    }
}

// =============================================================================
// Lanes
// =============================================================================

struct Routed<K> {
    key: K,
    task: Task,
}

/// Live lane-thread count, shared with the lane threads.
struct ThreadCount {
    live: Mutex<usize>,
    exited: Condvar,
}

impl ThreadCount {
    fn enter(&self) {
        *self.live.lock() += 1;
    }

    fn exit(&self) {
        let mut live = self.live.lock();
        *live -= 1;
        if *live == 0 {
            self.exited.notify_all();
        }
    }

    fn await_zero(&self, deadline: Instant) -> bool {
        let mut live = self.live.lock();
        while *live > 0 {
            if self.exited.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }
}

/// Signalled whenever a lane runs out of outstanding tasks.
struct IdleSignal {
    lock: Mutex<()>,
    cv: Condvar,
}

struct Lane<K> {
    index: usize,
    queue: Arc<TaskQueue<Routed<K>>>,
    outstanding: Arc<AtomicUsize>,
}

impl<K: Send + 'static> Lane<K> {
    fn spawn(
        name: &str,
        index: usize,
        threads: &Arc<ThreadCount>,
        idle: &Arc<IdleSignal>,
    ) -> Result<Self, ExecutorError> {
        let queue = Arc::new(TaskQueue::new());
        let outstanding = Arc::new(AtomicUsize::new(0));

        threads.enter();
        let spawned = {
            let queue = Arc::clone(&queue);
            let outstanding = Arc::clone(&outstanding);
            let threads = Arc::clone(threads);
            let idle = Arc::clone(idle);
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || lane_loop(index, queue, outstanding, threads, idle))
        };
        if let Err(e) = spawned {
            threads.exit();
            return Err(ExecutorError::InvalidConfig(format!(
                "failed to spawn partition thread: {e}"
            )));
        }

        Ok(Self {
            index,
            queue,
            outstanding,
        })
    }
}

impl<K> Lane<K> {
    fn push(&self, routed: Routed<K>) -> Result<(), ExecutorError> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.queue.push(routed).map_err(|_| {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            ExecutorError::Shutdown
        })
    }

    /// Close the lane and take back the tasks it had not started.
    fn evict(&self) -> Vec<Routed<K>> {
        self.queue.close();
        let drained = self.queue.drain();
        self.outstanding.fetch_sub(drained.len(), Ordering::AcqRel);
        debug!(partition = self.index, drained = drained.len(), "Evicted partition");
        drained
    }

    fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }
}

fn lane_loop<K>(
    index: usize,
    queue: Arc<TaskQueue<Routed<K>>>,
    outstanding: Arc<AtomicUsize>,
    threads: Arc<ThreadCount>,
    idle: Arc<IdleSignal>,
) {
    while let Some(routed) = queue.take() {
        if let Err(e) = run_catching(routed.task) {
            error!(partition = index, error = %e, "Partition task panicked");
        }
        if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = idle.lock.lock();
            idle.cv.notify_all();
        }
    }
    debug!(partition = index, "Partition lane exited");
    threads.exit();
}

// =============================================================================
// Partitioned Executor
// =============================================================================

struct Inner<K> {
    name: String,
    lanes: Arc<RwLock<Vec<Lane<K>>>>,
    threads: Arc<ThreadCount>,
    idle: Arc<IdleSignal>,
    partitioner: Box<dyn Partitioner<K>>,
    resize_policy: ResizePolicy,
    timer: TimerThread,
    closed: AtomicBool,
}

/// Executor that runs each key's tasks in order on one of N lanes.
pub struct PartitionedExecutor<K> {
    inner: Arc<Inner<K>>,
}

impl<K> PartitionedExecutor<K>
where
    K: Hash + Clone + Send + Sync + 'static,
{
    /// Build an executor routing keys by hash.
    pub fn new(config: &PartitionConfig) -> Result<Self, ExecutorError> {
        Self::with_partitioner(config, HashPartitioner)
    }
}

impl<K> PartitionedExecutor<K>
where
    K: Clone + Send + Sync + 'static,
{
    /// Build an executor with a custom partitioner.
    pub fn with_partitioner<P>(config: &PartitionConfig, partitioner: P) -> Result<Self, ExecutorError>
    where
        P: Partitioner<K> + 'static,
    {
        config.validate()?;

        let threads = Arc::new(ThreadCount {
            live: Mutex::new(0),
            exited: Condvar::new(),
        });
        let idle = Arc::new(IdleSignal {
            lock: Mutex::new(()),
            cv: Condvar::new(),
        });

        let mut lanes = Vec::with_capacity(config.partitions);
        for index in 0..config.partitions {
            match Lane::spawn(&config.name, index, &threads, &idle) {
                Ok(lane) => lanes.push(lane),
                Err(e) => {
                    for lane in &lanes {
                        lane.queue.close();
                    }
                    return Err(e);
                }
            }
        }
        let lanes = Arc::new(RwLock::new(lanes));

        let on_exit_lanes = Arc::clone(&lanes);
        let timer = TimerThread::spawn(
            &config.name,
            Box::new(move || {
                for lane in on_exit_lanes.read().iter() {
                    lane.queue.close();
                }
            }),
        )
        .inspect_err(|_| {
            for lane in lanes.read().iter() {
                lane.queue.close();
            }
        })?;

        info!(
            name = %config.name,
            partitions = config.partitions,
            resize_policy = ?config.resize_policy,
            "Partitioned executor started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                name: config.name.clone(),
                lanes,
                threads,
                idle,
                partitioner: Box::new(partitioner),
                resize_policy: config.resize_policy,
                timer,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Run a task on the key's partition.
    pub fn execute<F>(&self, key: K, f: F) -> Result<(), ExecutorError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.route(key, Box::new(f))
    }

    /// Run a task on the key's partition and return a handle to its result.
    pub fn submit<F, T>(&self, key: K, f: F) -> Result<TaskHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (task, handle) = with_handle(f);
        self.inner.route(key, task)?;
        Ok(handle)
    }

    /// Run a task on the key's partition after `delay`.
    ///
    /// The partition is chosen when the task fires, not when it is scheduled.
    pub fn schedule<F, T>(&self, key: K, f: F, delay: Duration) -> Result<ScheduledHandle<T>, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_open()?;
        let (task, handle) = with_handle(f);
        self.inner
            .timer
            .schedule_once(delay, task, handle, self.keyed_target(key))
    }

    /// Run a task on the key's partition every `period`.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        key: K,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<PeriodicHandle, ExecutorError>
    where
        F: FnMut() + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.timer.schedule_periodic(
            initial_delay,
            period,
            Repeat::FixedRate,
            Box::new(f),
            self.keyed_target(key),
        )
    }

    /// Run a task on the key's partition, waiting `delay` after each run.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        key: K,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<PeriodicHandle, ExecutorError>
    where
        F: FnMut() + Send + 'static,
    {
        self.ensure_open()?;
        self.inner.timer.schedule_periodic(
            initial_delay,
            delay,
            Repeat::FixedDelay,
            Box::new(f),
            self.keyed_target(key),
        )
    }

    /// Current number of partitions.
    pub fn partitions(&self) -> usize {
        self.inner.lanes.read().len()
    }

    /// Partition the key would be routed to right now.
    pub fn partition_for(&self, key: &K) -> usize {
        let partitions = self.partitions();
        self.inner.partitioner.to_partition(key, partitions) % partitions
    }

    /// Grow to `partitions` lanes.
    ///
    /// Under [`ResizePolicy::Quiesce`] this waits for all lanes to go idle
    /// while holding submissions back; it must not be called from a task
    /// running on this executor.
    pub fn expand_to(&self, partitions: usize) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let mut lanes = self.inner.lanes.write();
        let current = lanes.len();
        if partitions < current {
            return Err(ExecutorError::InvalidConfig(format!(
                "cannot expand from {current} to {partitions} partitions"
            )));
        }
        if partitions == current {
            return Ok(());
        }
        if self.inner.resize_policy == ResizePolicy::Quiesce {
            self.inner.wait_idle(&lanes);
        }

        for index in current..partitions {
            lanes.push(Lane::spawn(
                &self.inner.name,
                index,
                &self.inner.threads,
                &self.inner.idle,
            )?);
        }

        info!(name = %self.inner.name, from = current, to = partitions, "Expanded partitions");
        Ok(())
    }

    /// Shrink to `partitions` lanes.
    ///
    /// Under [`ResizePolicy::Reorder`] the evicted lanes' queued tasks are
    /// resubmitted by their original key. Under [`ResizePolicy::Quiesce`] this
    /// waits for all lanes to go idle first and must not be called from a task
    /// running on this executor.
    pub fn shrink_to(&self, partitions: usize) -> Result<(), ExecutorError> {
        self.ensure_open()?;
        let mut lanes = self.inner.lanes.write();
        let current = lanes.len();
        if partitions == 0 || partitions > current {
            return Err(ExecutorError::InvalidConfig(format!(
                "cannot shrink from {current} to {partitions} partitions"
            )));
        }
        if partitions == current {
            return Ok(());
        }
        if self.inner.resize_policy == ResizePolicy::Quiesce {
            self.inner.wait_idle(&lanes);
        }

        let evicted = lanes.split_off(partitions);
        let mut resubmitted = 0usize;
        for lane in &evicted {
            for routed in lane.evict() {
                self.inner.route_locked(&lanes, routed.key, routed.task)?;
                resubmitted += 1;
            }
        }

        if resubmitted > 0 {
            warn!(
                name = %self.inner.name,
                resubmitted,
                "Resubmitted tasks from evicted partitions; per-key order may change"
            );
        }
        info!(name = %self.inner.name, from = current, to = partitions, "Shrank partitions");
        Ok(())
    }

    /// Stop accepting work. Queued tasks and armed one-shot timers still run.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.inner.name, "Partitioned executor shutting down");
        // Lanes are closed by the timer thread once its one-shot entries fired.
        self.inner.timer.shutdown();
    }

    /// Stop accepting work and discard everything not yet started.
    pub fn shutdown_now(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        let timers = self.inner.timer.shutdown_now();
        let queued: usize = self
            .inner
            .lanes
            .read()
            .iter()
            .map(|lane| lane.evict().len())
            .sum();
        timers + queued
    }

    /// Wait for the scheduler and every lane thread to exit.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.inner.timer.await_exit(deadline) && self.inner.threads.await_zero(deadline)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of tasks queued or running across all lanes.
    pub fn outstanding(&self) -> usize {
        self.inner
            .lanes
            .read()
            .iter()
            .map(|lane| lane.outstanding.load(Ordering::Acquire))
            .sum()
    }

    fn ensure_open(&self) -> Result<(), ExecutorError> {
        if self.is_shutdown() {
            return Err(ExecutorError::Shutdown);
        }
        Ok(())
    }

    fn keyed_target(&self, key: K) -> Arc<dyn Submitter> {
        Arc::new(KeyedTarget {
            inner: Arc::downgrade(&self.inner),
            key,
        })
    }
}

impl<K> Inner<K> {
    fn route(&self, key: K, task: Task) -> Result<(), ExecutorError> {
        let lanes = self.lanes.read();
        self.route_locked(&lanes, key, task)
    }

    fn route_locked(&self, lanes: &[Lane<K>], key: K, task: Task) -> Result<(), ExecutorError> {
        let partitions = lanes.len();
        let index = self.partitioner.to_partition(&key, partitions) % partitions;
        lanes[index].push(Routed { key, task })
    }

    fn wait_idle(&self, lanes: &[Lane<K>]) {
        let mut guard = self.idle.lock.lock();
        while !lanes.iter().all(Lane::is_idle) {
            // Timed wait so a notification racing the check cannot strand us.
            self.idle.cv.wait_for(&mut guard, Duration::from_millis(10));
        }
        debug!(name = %self.name, partitions = lanes.len(), "All partitions idle");
    }
}

impl<K> Drop for PartitionedExecutor<K> {
    fn drop(&mut self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.timer.shutdown();
        }
    }
}

impl<K> std::fmt::Debug for PartitionedExecutor<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedExecutor")
            .field("name", &self.inner.name)
            .field("partitions", &self.inner.lanes.read().len())
            .field("resize_policy", &self.inner.resize_policy)
            .field("shutdown", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Routes timer-fired tasks back through the executor by key.
struct KeyedTarget<K> {
    inner: Weak<Inner<K>>,
    key: K,
}

impl<K> Submitter for KeyedTarget<K>
where
    K: Clone + Send + Sync + 'static,
{
    fn execute_task(&self, task: Task) -> Result<(), ExecutorError> {
        let inner = self.inner.upgrade().ok_or(ExecutorError::Shutdown)?;
        inner.route(self.key.clone(), task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_resize_policy_from_str() {
        assert_eq!("reorder".parse::<ResizePolicy>(), Ok(ResizePolicy::Reorder));
        assert_eq!("QUIESCE".parse::<ResizePolicy>(), Ok(ResizePolicy::Quiesce));
        assert!("drop".parse::<ResizePolicy>().is_err());
    }

    #[test]
    fn test_fn_partitioner() {
        let partitioner = partitioner_fn(|key: &u32, n: usize| *key as usize % n);
        assert_eq!(partitioner.to_partition(&7u32, 4), 3);
    }

    proptest! {
        #[test]
        fn hash_partition_in_range(key in any::<u64>(), partitions in 1usize..64) {
            let partition = HashPartitioner.to_partition(&key, partitions);
            prop_assert!(partition < partitions);
        }

        #[test]
        fn hash_partition_is_deterministic(key in ".*", partitions in 1usize..64) {
            let first = HashPartitioner.to_partition(key.as_str(), partitions);
            let second = HashPartitioner.to_partition(key.as_str(), partitions);
            prop_assert_eq!(first, second);
        }
    }
}
