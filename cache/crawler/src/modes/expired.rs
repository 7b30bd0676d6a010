//! Expired-item reaping mode.
//!
//! Drives both the user-initiated `EXPIRED` crawl and the periodic
//! `AUTOEXPIRE` crawl. Reaps items that are expired, flushed, or whose
//! external storage no longer validates, and buckets the remaining TTL
//! of everything it leaves behind.

use super::EvalCx;
use parking_lot::{Mutex, MutexGuard};
use scour_core::flag;
use std::sync::Arc;
use tracing::trace;

/// TTL histogram width: one bucket per minute up to an hour.
pub const HISTO_BUCKETS: usize = 61;

/// Per-class reap statistics for one crawl.
#[derive(Debug, Clone)]
pub struct ClassExpireStats {
    /// When this class's sweep began, relative coarse seconds.
    pub start_time: u32,
    /// When this class's sweep finished.
    pub end_time: u32,
    /// Whether the class sweep ran to completion.
    pub run_complete: bool,
    /// Live items seen and left in place.
    pub seen: u64,
    /// Items reaped.
    pub reclaimed: u64,
    /// Live items with no expiration.
    pub noexp: u64,
    /// Live items expiring more than an hour out.
    pub ttl_hourplus: u64,
    /// Live items bucketed by remaining TTL, one minute per bucket.
    pub histo: [u64; HISTO_BUCKETS],
}

impl ClassExpireStats {
    fn zeroed(now: u32) -> Self {
        Self {
            start_time: now,
            end_time: 0,
            run_complete: false,
            seen: 0,
            reclaimed: 0,
            noexp: 0,
            ttl_hourplus: 0,
            histo: [0; HISTO_BUCKETS],
        }
    }
}

/// Crawl-level summary fields.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredSummary {
    /// When the crawl began.
    pub start_time: u32,
    /// When the crawl finished.
    pub end_time: u32,
    /// Whether every class ran to completion.
    pub crawl_complete: bool,
    /// Whether the block was supplied by an outside caller.
    pub is_external: bool,
}

struct ExpiredInner {
    classes: Box<[ClassExpireStats]>,
    start_time: u32,
    end_time: u32,
    crawl_complete: bool,
    is_external: bool,
}

/// Reap statistics block, one record per LRU chain.
///
/// A caller that wants to watch a reap (the periodic maintainer does)
/// passes its own `Arc` into the crawl start; otherwise the mode keeps a
/// private one that dies with the crawl.
pub struct ExpiredStats {
    inner: Mutex<ExpiredInner>,
}

impl ExpiredStats {
    /// A zeroed stats block.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ExpiredInner {
                classes: (0..scour_core::POWER_LARGEST)
                    .map(|_| ClassExpireStats::zeroed(0))
                    .collect(),
                start_time: 0,
                end_time: 0,
                crawl_complete: false,
                is_external: false,
            }),
        }
    }

    /// Snapshot one class's record.
    pub fn class_stats(&self, class: usize) -> ClassExpireStats {
        self.inner.lock().classes[class].clone()
    }

    /// Snapshot the crawl-level summary.
    pub fn summary(&self) -> ExpiredSummary {
        let inner = self.inner.lock();
        ExpiredSummary {
            start_time: inner.start_time,
            end_time: inner.end_time,
            crawl_complete: inner.crawl_complete,
            is_external: inner.is_external,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExpiredInner> {
        self.inner.lock()
    }
}

impl Default for ExpiredStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The expired mode's per-crawl state.
pub(crate) struct ExpiredModule {
    stats: Arc<ExpiredStats>,
}

impl ExpiredModule {
    pub(crate) fn new(data: Option<Arc<ExpiredStats>>, now: u32) -> Self {
        let (stats, external) = match data {
            Some(stats) => (stats, true),
            None => (Arc::new(ExpiredStats::new()), false),
        };
        {
            let mut inner = stats.lock();
            if external {
                inner.is_external = true;
            } else {
                inner.start_time = now;
            }
            inner.end_time = 0;
            inner.crawl_complete = false;
            for class in inner.classes.iter_mut() {
                *class = ClassExpireStats::zeroed(now);
            }
        }
        Self { stats }
    }

    pub(crate) fn eval(&mut self, cx: &mut EvalCx<'_, '_, '_>, id: u32, hv: u64, class: usize) {
        let mut inner = self.stats.lock();
        let record = &mut inner.classes[class];
        let slot = cx.cache.pool().get(id);
        let now = cx.cache.clock().now();
        let is_flushed = cx.cache.item_is_flushed(id);
        let mut is_valid = true;
        if slot.has_flag(flag::EXT_HDR) {
            if let Some(storage) = cx.storage {
                is_valid = storage.validate(slot);
            }
        }

        if slot.is_expired(now) || is_flushed || !is_valid {
            record.reclaimed += 1;
            trace!(
                class,
                flags = slot.flags(),
                key = ?slot.key(),
                "reaping dead item"
            );
            let guard = cx.class.take().expect("reap eval runs under the class lock");
            guard.cursor_mut().reclaimed += 1;
            if !slot.has_flag(flag::FETCHED) && !is_flushed {
                guard.cursor_mut().unfetched += 1;
            }
            if slot.has_flag(flag::EXT_HDR) {
                if let Some(storage) = cx.storage {
                    storage.delete(slot);
                }
            }
            let bucket = cx.bucket.expect("reap eval holds the bucket stripe");
            cx.cache.unlink_nolock(guard, bucket, hv, id);
            cx.cache.release(id);
        } else {
            record.seen += 1;
            cx.cache.release(id);
            let exp = slot.exptime();
            if exp == 0 {
                record.noexp += 1;
            } else if exp - now > 3599 {
                record.ttl_hourplus += 1;
            } else {
                let bucket = ((exp - now) / 60) as usize;
                if bucket < HISTO_BUCKETS {
                    record.histo[bucket] += 1;
                }
            }
        }
    }

    pub(crate) fn doneclass(&mut self, now: u32, class: usize) {
        let mut inner = self.stats.lock();
        inner.classes[class].end_time = now;
        inner.classes[class].run_complete = true;
    }

    pub(crate) fn finalize(&mut self, now: u32) {
        let mut inner = self.stats.lock();
        inner.end_time = now;
        inner.crawl_complete = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_block_is_marked() {
        let external = Arc::new(ExpiredStats::new());
        assert!(!external.summary().is_external);
        let _module = ExpiredModule::new(Some(Arc::clone(&external)), 5);
        let summary = external.summary();
        assert!(summary.is_external);
        assert!(!summary.crawl_complete);
        assert_eq!(external.class_stats(1).start_time, 5);
    }

    #[test]
    fn test_internal_block_stamps_start() {
        let module = ExpiredModule::new(None, 9);
        let summary = module.stats.summary();
        assert!(!summary.is_external);
        assert_eq!(summary.start_time, 9);
    }

    #[test]
    fn test_doneclass_and_finalize_stamp() {
        let mut module = ExpiredModule::new(None, 1);
        module.doneclass(4, 2);
        module.finalize(6);
        let class = module.stats.class_stats(2);
        assert!(class.run_complete);
        assert_eq!(class.end_time, 4);
        let summary = module.stats.summary();
        assert!(summary.crawl_complete);
        assert_eq!(summary.end_time, 6);
    }

    #[test]
    fn test_reuse_zeroes_previous_run() {
        let external = Arc::new(ExpiredStats::new());
        {
            let mut inner = external.lock();
            inner.classes[3].seen = 42;
            inner.crawl_complete = true;
        }
        let _module = ExpiredModule::new(Some(Arc::clone(&external)), 7);
        assert_eq!(external.class_stats(3).seen, 0);
        assert!(!external.summary().crawl_complete);
    }
}
