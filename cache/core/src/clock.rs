//! Coarse process clock.
//!
//! Item timestamps are stored as seconds relative to process start, the
//! same way the wider server keeps its `current_time`. The clock only
//! moves when ticked, which keeps sweeps deterministic: a scan observes a
//! single coarse "now" per tick rather than a continuously moving one.

use crate::sync::{AtomicU32, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Coarse relative clock: seconds since process start.
pub struct Clock {
    /// Unix time at construction, for converting relative stamps back to
    /// absolute time.
    started: u64,
    base: Instant,
    rel: AtomicU32,
}

impl Clock {
    /// Create a clock anchored at the current wall time.
    pub fn new() -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            started,
            base: Instant::now(),
            rel: AtomicU32::new(0),
        }
    }

    /// Current coarse time, in seconds since process start.
    #[inline]
    pub fn now(&self) -> u32 {
        self.rel.load(Ordering::Relaxed)
    }

    /// Synchronize the coarse time with the monotonic clock.
    ///
    /// Monotonic with respect to [`Clock::advance`]: ticking never moves
    /// the coarse time backwards.
    pub fn tick(&self) {
        let elapsed = self.base.elapsed().as_secs().min(u32::MAX as u64) as u32;
        self.rel.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Push the coarse clock forward without consulting the wall clock.
    pub fn advance(&self, secs: u32) {
        self.rel.fetch_add(secs, Ordering::Relaxed);
    }

    /// Unix time at process start.
    #[inline]
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Convert a relative stamp to absolute unix time.
    #[inline]
    pub fn to_unix(&self, rel: u32) -> u64 {
        self.started + rel as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_advance_moves_now() {
        let clock = Clock::new();
        assert_eq!(clock.now(), 0);
        clock.advance(10);
        assert_eq!(clock.now(), 10);
        clock.advance(5);
        assert_eq!(clock.now(), 15);
    }

    #[test]
    fn test_tick_never_rewinds() {
        let clock = Clock::new();
        clock.advance(100);
        clock.tick();
        assert!(clock.now() >= 100);
    }

    #[test]
    fn test_to_unix() {
        let clock = Clock::new();
        let started = clock.started();
        assert_eq!(clock.to_unix(0), started);
        assert_eq!(clock.to_unix(42), started + 42);
    }
}
