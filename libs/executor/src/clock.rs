//! Monotonic time sources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Millisecond clock that never goes backwards.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock's origin.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock advanced by hand, for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move the clock forward by `ms`.
    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Set the clock; earlier values are ignored.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.fetch_max(now_ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.now_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now_ms() >= first + 5);
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new(100);
        clock.advance(20);
        assert_eq!(clock.now_ms(), 120);
        clock.set(50);
        assert_eq!(clock.now_ms(), 120);
        clock.set(200);
        assert_eq!(clock.now_ms(), 200);
    }
}
