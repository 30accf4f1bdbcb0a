//! Hashed time wheel.
//!
//! A fixed ring of slots, each `unit` wide. An entry due at `t` ms lives in
//! slot `ceil(t / unit) mod slot_count` until it fires, is cancelled, or (for
//! periodic entries) migrates to the slot of its next firing. Rounding up
//! means an entry is always due by the time its slot is scanned. Entries more
//! than one revolution ahead share a slot with nearer ones and are skipped
//! until their time comes.
//!
//! One tick thread sleeps to each slot boundary and fires every due entry in
//! the `slot_per_round` most recent slots (plus any slots it overslept).
//! Handlers run on the tick thread and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::ExecutorError;
use crate::task::run_catching;

/// Time wheel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelConfig {
    /// Number of slots in the ring.
    pub slot_count: usize,

    /// Width of one slot.
    pub unit: Duration,

    /// How many recently passed slots each tick scans.
    pub slot_per_round: usize,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            slot_count: 512,
            unit: Duration::from_millis(10),
            slot_per_round: 2,
        }
    }
}

impl WheelConfig {
    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.slot_count == 0 {
            return Err(ExecutorError::InvalidConfig(
                "slot_count must be at least 1".to_string(),
            ));
        }
        if self.unit.as_millis() == 0 {
            return Err(ExecutorError::InvalidConfig(
                "unit must be at least 1ms".to_string(),
            ));
        }
        if self.slot_per_round == 0 || self.slot_per_round > self.slot_count {
            return Err(ExecutorError::InvalidConfig(format!(
                "slot_per_round must be between 1 and {}",
                self.slot_count
            )));
        }
        Ok(())
    }
}

/// Identifier of a pushed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// An entry waiting in the wheel.
#[derive(Debug, Clone)]
pub struct TimerEntry<T> {
    id: TimerId,
    fire_at_ms: u64,
    period_ms: Option<u64>,
    payload: T,
    cloner: Option<fn(&T) -> T>,
}

impl<T> TimerEntry<T> {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Clock time (ms) at which the entry is due.
    pub fn fire_at_ms(&self) -> u64 {
        self.fire_at_ms
    }

    pub fn period(&self) -> Option<Duration> {
        self.period_ms.map(Duration::from_millis)
    }

    pub fn is_periodic(&self) -> bool {
        self.period_ms.is_some()
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

type Handler<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

struct WheelInner<T> {
    config: WheelConfig,
    unit_ms: u64,
    slots: Vec<Mutex<Vec<TimerEntry<T>>>>,
    /// Live entries and the slot each one sits in. Locked before a slot
    /// when both are needed.
    index: Mutex<HashMap<TimerId, usize>>,
    /// Last tick scanned. Advanced only while `index` is held, so an
    /// insert never lands in a tick the scan has already passed.
    cursor: AtomicU64,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    handler: Handler<T>,
    running: AtomicBool,
    stop_lock: Mutex<()>,
    stop_signal: Condvar,
}

/// Ring of time slots fired by a single tick thread.
pub struct HashedTimeWheel<T> {
    inner: Arc<WheelInner<T>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> HashedTimeWheel<T> {
    /// Create a stopped wheel. Call [`start`](Self::start) to begin ticking.
    pub fn new<F>(config: WheelConfig, clock: Arc<dyn Clock>, handler: F) -> Result<Self, ExecutorError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        config.validate()?;
        let unit_ms = config.unit.as_millis() as u64;
        let cursor = clock.now_ms() / unit_ms;
        let slots = (0..config.slot_count).map(|_| Mutex::new(Vec::new())).collect();

        Ok(Self {
            inner: Arc::new(WheelInner {
                config,
                unit_ms,
                slots,
                index: Mutex::new(HashMap::new()),
                cursor: AtomicU64::new(cursor),
                next_id: AtomicU64::new(0),
                clock,
                handler: Box::new(handler),
                running: AtomicBool::new(false),
                stop_lock: Mutex::new(()),
                stop_signal: Condvar::new(),
            }),
            ticker: Mutex::new(None),
        })
    }

    /// Add a one-shot entry due at `fire_at_ms` clock time.
    pub fn push(&self, fire_at_ms: u64, payload: T) -> TimerId {
        self.inner.insert(fire_at_ms, None, payload, None)
    }

    /// Add a one-shot entry due `delay` from now.
    pub fn push_after(&self, delay: Duration, payload: T) -> TimerId {
        let fire_at_ms = self.inner.clock.now_ms() + delay.as_millis() as u64;
        self.push(fire_at_ms, payload)
    }

    /// Remove an entry. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let Some(slot) = self.inner.index.lock().remove(&id) else {
            return false;
        };
        self.inner.slots[slot].lock().retain(|entry| entry.id != id);
        true
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Slot an entry due at `fire_at_ms` hashes to.
    pub fn slot_for(&self, fire_at_ms: u64) -> usize {
        self.inner.slot_of_tick(self.inner.tick_of(fire_at_ms))
    }

    /// Fire everything due at `now_ms`. Returns the number of handler calls.
    ///
    /// The tick thread calls this at every slot boundary; tests may call it
    /// directly on a wheel that was never started.
    pub fn tick(&self, now_ms: u64) -> usize {
        self.inner.tick(now_ms)
    }

    /// Spawn the tick thread. Returns false if it is already running.
    pub fn start(&self) -> Result<bool, ExecutorError> {
        let mut ticker = self.ticker.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("time-wheel".to_string())
            .spawn(move || tick_loop(inner))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::Release);
                ExecutorError::InvalidConfig(format!("failed to spawn wheel thread: {e}"))
            })?;
        *ticker = Some(handle);

        info!(
            slots = self.inner.config.slot_count,
            unit_ms = self.inner.unit_ms,
            slot_per_round = self.inner.config.slot_per_round,
            "Time wheel started"
        );
        Ok(true)
    }

    /// Halt the tick thread and hand back every entry that never fired,
    /// ordered by due time. Must not be called from a handler.
    pub fn stop(&self) -> Vec<TimerEntry<T>> {
        self.inner.running.store(false, Ordering::Release);
        {
            let _guard = self.inner.stop_lock.lock();
            self.inner.stop_signal.notify_all();
        }
        if let Some(handle) = self.ticker.lock().take() {
            if handle.join().is_err() {
                error!("Time wheel thread panicked");
            }
        }

        self.inner.index.lock().clear();
        let mut unfired: Vec<_> = self
            .inner
            .slots
            .iter()
            .flat_map(|slot| std::mem::take(&mut *slot.lock()))
            .collect();
        unfired.sort_by_key(|entry| (entry.fire_at_ms, entry.id));

        info!(unfired = unfired.len(), "Time wheel stopped");
        unfired
    }
}

impl<T: Clone + Send + 'static> HashedTimeWheel<T> {
    /// Add an entry first due at `fire_at_ms` and then every `period`.
    pub fn push_periodic(&self, fire_at_ms: u64, period: Duration, payload: T) -> Result<TimerId, ExecutorError> {
        let period_ms = period.as_millis() as u64;
        if period_ms == 0 {
            return Err(ExecutorError::InvalidConfig(
                "period must be at least 1ms".to_string(),
            ));
        }
        Ok(self
            .inner
            .insert(fire_at_ms, Some(period_ms), payload, Some(T::clone)))
    }
}

impl<T> WheelInner<T> {
    fn slot_of_tick(&self, tick: u64) -> usize {
        (tick % self.config.slot_count as u64) as usize
    }

    /// First tick at or after `fire_at_ms`.
    fn tick_of(&self, fire_at_ms: u64) -> u64 {
        fire_at_ms.div_ceil(self.unit_ms)
    }

    fn insert(
        &self,
        fire_at_ms: u64,
        period_ms: Option<u64>,
        payload: T,
        cloner: Option<fn(&T) -> T>,
    ) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.place(TimerEntry {
            id,
            fire_at_ms,
            period_ms,
            payload,
            cloner,
        });
        id
    }

    fn place(&self, entry: TimerEntry<T>) {
        let mut index = self.index.lock();
        let slot = self.slot_for_entry(&entry);
        index.insert(entry.id, slot);
        self.slots[slot].lock().push(entry);
    }

    /// Put a fired periodic entry back, unless it was cancelled meanwhile.
    fn rearm(&self, entry: TimerEntry<T>) {
        let mut index = self.index.lock();
        let slot = self.slot_for_entry(&entry);
        let Some(current) = index.get_mut(&entry.id) else {
            return;
        };
        *current = slot;
        self.slots[slot].lock().push(entry);
    }

    /// Caller holds `index`.
    fn slot_for_entry(&self, entry: &TimerEntry<T>) -> usize {
        // Entries due in an already scanned tick go into the next one.
        let tick = self
            .tick_of(entry.fire_at_ms)
            .max(self.cursor.load(Ordering::Acquire) + 1);
        self.slot_of_tick(tick)
    }

    fn tick(&self, now_ms: u64) -> usize {
        let now_tick = now_ms / self.unit_ms;
        let previous = {
            let _index = self.index.lock();
            self.cursor.fetch_max(now_tick, Ordering::AcqRel)
        };

        let lookback = (now_tick + 1).saturating_sub(self.config.slot_per_round as u64);
        let oldest = now_tick.saturating_sub(self.config.slot_count as u64 - 1);
        let first = (previous + 1).min(lookback).max(oldest);

        let mut fired = 0;
        for tick in first..=now_tick {
            fired += self.fire_slot(self.slot_of_tick(tick), now_ms);
        }
        fired
    }

    fn fire_slot(&self, slot: usize, now_ms: u64) -> usize {
        let due: Vec<TimerEntry<T>> = {
            let mut entries = self.slots[slot].lock();
            if entries.is_empty() {
                return 0;
            }
            let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *entries)
                .into_iter()
                .partition(|entry| entry.fire_at_ms <= now_ms);
            *entries = pending;
            due
        };

        let mut fired = 0;
        for mut entry in due {
            match (entry.period_ms, entry.cloner) {
                (Some(period_ms), Some(cloner)) => {
                    if !self.index.lock().contains_key(&entry.id) {
                        continue;
                    }
                    self.invoke(entry.id, cloner(&entry.payload));
                    fired += 1;

                    entry.fire_at_ms = next_fire(entry.fire_at_ms, period_ms, now_ms);
                    self.rearm(entry);
                }
                _ => {
                    if self.index.lock().remove(&entry.id).is_none() {
                        continue;
                    }
                    self.invoke(entry.id, entry.payload);
                    fired += 1;
                }
            }
        }
        fired
    }

    fn invoke(&self, id: TimerId, payload: T) {
        if let Err(e) = run_catching(|| (self.handler)(payload)) {
            error!(timer_id = ?id, error = %e, "Time wheel handler panicked");
        }
    }
}

/// Next due time of a periodic entry, skipping periods already missed.
fn next_fire(fire_at_ms: u64, period_ms: u64, now_ms: u64) -> u64 {
    let next = fire_at_ms + period_ms;
    if next > now_ms {
        return next;
    }
    let missed = (now_ms - fire_at_ms) / period_ms;
    fire_at_ms + (missed + 1) * period_ms
}

fn tick_loop<T>(inner: Arc<WheelInner<T>>) {
    debug!("Time wheel tick loop running");
    while inner.running.load(Ordering::Acquire) {
        let now = inner.clock.now_ms();
        let boundary = (now / inner.unit_ms + 1) * inner.unit_ms;
        let wait = Duration::from_millis(boundary - now);

        {
            let mut guard = inner.stop_lock.lock();
            if !inner.running.load(Ordering::Acquire) {
                break;
            }
            inner.stop_signal.wait_for(&mut guard, wait);
        }
        if !inner.running.load(Ordering::Acquire) {
            break;
        }

        inner.tick(inner.clock.now_ms());
    }
    debug!("Time wheel tick loop exited");
}

impl<T> Drop for HashedTimeWheel<T> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        let _guard = self.inner.stop_lock.lock();
        self.inner.stop_signal.notify_all();
    }
}
