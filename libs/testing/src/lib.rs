//! # courier-testing
//!
//! Shared helpers for courier tests:
//! - [`wait_until`] polls a condition with a deadline
//! - [`Recorder`] collects values from many threads in arrival order
//! - [`ConcurrencyProbe`] tracks how many threads are inside a section at once
//! - [`init_tracing`] installs a test-friendly subscriber once per process

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Default time budget for waits in tests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `condition` every millisecond until it holds or `timeout` elapses.
///
/// Returns the final value of the condition.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Install a `tracing` subscriber writing through the test harness.
///
/// Filter comes from `RUST_LOG` (default `warn`). Safe to call from every
/// test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Recorder
// =============================================================================

/// Thread-safe, cloneable log of values.
#[derive(Debug)]
pub struct Recorder<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for Recorder<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T> Recorder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Wait until at least `count` items were recorded.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.len() >= count)
    }
}

impl<T: Clone> Recorder<T> {
    /// Copy of everything recorded so far.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().clone()
    }
}

// =============================================================================
// Concurrency Probe
// =============================================================================

/// Counts threads currently inside a guarded section and remembers the peak.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the section. Returns the number of threads inside, including
    /// this one. The section is left when the guard drops.
    pub fn enter(&self) -> (ProbeGuard<'_>, usize) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        (ProbeGuard { probe: self }, now)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of threads seen inside at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Leaves the probed section on drop.
#[derive(Debug)]
pub struct ProbeGuard<'a> {
    probe: &'a ConcurrencyProbe,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(10), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }

    #[test]
    fn test_recorder_across_threads() {
        let recorder = Recorder::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let recorder = recorder.clone();
                thread::spawn(move || recorder.record(i))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut items = recorder.snapshot();
        items.sort();
        assert_eq!(items, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();
        {
            let (_a, first) = probe.enter();
            let (_b, second) = probe.enter();
            assert_eq!(first, 1);
            assert_eq!(second, 2);
        }
        assert_eq!(probe.active(), 0);
        assert_eq!(probe.peak(), 2);
    }
}
