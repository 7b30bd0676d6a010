//! The crawler worker thread.
//!
//! Parks on the crawler condition until a crawl is started, then drives
//! either the per-class scan or the hash walk. The crawler mutex stays
//! held across the scan; it is released only inside the pacing naps and
//! the brief yield cycles, which is what keeps control callers from
//! observing a half-mutated crawl.

use crate::client::MIN_BUFSPACE;
use crate::controller::{CrawlState, CrawlerInner, HASH_WALK};
use crate::modes::EvalCx;
use parking_lot::MutexGuard;
use scour_core::sync::Ordering;
use scour_core::{ClassGuard, IterStep, POWER_LARGEST};
use std::time::Duration;
use tracing::{debug, trace};

/// Batch output a little before flushing to cut down on poll/write
/// syscalls during hash walks.
const MIN_ITEMS_PER_WRITE: u32 = 16;

pub(crate) fn run(inner: &CrawlerInner) {
    let mut st = inner.state.lock();
    inner.cond.notify_one();
    debug!("lru crawler worker started");
    while st.run_thread {
        inner.cond.wait(&mut st);

        if st.tocrawl == HASH_WALK {
            scan_hash(inner, &mut st);
            st.tocrawl = 0;
        } else if st.tocrawl > 0 {
            scan_classes(inner, &mut st);
        }

        finish_crawl(inner, &mut st);
        inner.running.store(false, Ordering::Release);
        trace!("lru crawler worker sleeping");
    }
    debug!("lru crawler worker stopping");
}

fn scan_classes(inner: &CrawlerInner, st: &mut MutexGuard<'_, CrawlState>) {
    let pool = inner.cache.pool();
    let mut persleep = inner.settings.crawls_per_sleep as i64;

    while st.tocrawl > 0 {
        if !st.run_thread {
            // Stop requested between items: close out the remaining
            // classes so every cursor comes off its chain.
            for class in 0..POWER_LARGEST {
                if inner.cache.class(class).cursor_active_hint() {
                    class_done(inner, st, class);
                }
            }
            st.tocrawl = st.tocrawl.max(0);
            return;
        }

        for class_idx in 0..POWER_LARGEST {
            let class = inner.cache.class(class_idx);
            if !class.cursor_active_hint() {
                continue;
            }

            // Buffer maintenance happens before any lock is taken: a
            // flush may block in poll for up to a second. Eval is owed
            // MIN_BUFSPACE of headroom, so a timed-out flush falls back
            // to growing the buffer.
            {
                let active = st.active.as_mut().expect("crawl active");
                if active.client.is_attached() {
                    if active.client.free_space() < MIN_BUFSPACE {
                        if active.client.flush(inner.router.as_ref()).is_err() {
                            class_done(inner, st, class_idx);
                            continue;
                        }
                        if active.client.free_space() < MIN_BUFSPACE
                            && active.client.expand().is_err()
                        {
                            class_done(inner, st, class_idx);
                            continue;
                        }
                    }
                } else if active.ty.needs_client() {
                    class_done(inner, st, class_idx);
                    continue;
                }
            }

            let mut guard = class.lock();
            let victim = match guard.crawl_peek() {
                Some(victim) => victim,
                None => {
                    trace!(class = class_idx, "nothing left to crawl");
                    class_done_locked(inner, st, guard, class_idx);
                    continue;
                }
            };
            let slot = pool.get(victim);
            let hv = inner.cache.hash(slot.key());

            // Never block on a bucket while holding the class lock; on
            // contention the cursor holds position and the same
            // candidate is retried next pass.
            let bucket = match inner.cache.table().try_lock_bucket(hv) {
                Some(bucket) => bucket,
                None => continue,
            };

            let stepped = guard.crawl_step(pool);
            debug_assert_eq!(stepped, Some(victim));
            let exhausted = {
                let cursor = guard.cursor_mut();
                if cursor.remaining != 0 {
                    cursor.remaining -= 1;
                    cursor.remaining < 1
                } else {
                    false
                }
            };
            if exhausted {
                trace!(class = class_idx, "crawl budget exhausted");
                drop(bucket);
                class_done_locked(inner, st, guard, class_idx);
                continue;
            }
            if slot.refcount_incr() != 2 {
                // Someone else holds a reference; the item is in a
                // transitional state. Skip it.
                slot.refcount_decr();
                continue;
            }
            guard.cursor_mut().checked += 1;

            let active = st.active.as_mut().expect("crawl active");
            if active.ty.needs_lock() {
                let mut cx = EvalCx {
                    cache: inner.cache.as_ref(),
                    storage: inner.storage.as_deref(),
                    sink: Some(&mut active.client),
                    class: Some(&mut guard),
                    bucket: Some(&bucket),
                };
                active.module.eval(&mut cx, victim, hv, class_idx);
                drop(bucket);
                drop(guard);
            } else {
                drop(guard);
                let mut cx = EvalCx {
                    cache: inner.cache.as_ref(),
                    storage: inner.storage.as_deref(),
                    sink: Some(&mut active.client),
                    class: None,
                    bucket: Some(&bucket),
                };
                active.module.eval(&mut cx, victim, hv, class_idx);
                drop(bucket);
            }

            persleep -= 1;
            if persleep <= 0 && inner.settings.sleep_us > 0 {
                MutexGuard::unlocked(st, || {
                    std::thread::sleep(Duration::from_micros(inner.settings.sleep_us as u64));
                });
                persleep = inner.settings.crawls_per_sleep as i64;
            } else if inner.settings.sleep_us == 0 {
                // Cycle the mutex so waiting control callers get a turn.
                MutexGuard::unlocked(st, || {});
            }
        }
    }
}

fn scan_hash(inner: &CrawlerInner, st: &mut MutexGuard<'_, CrawlState>) {
    let pool = inner.cache.pool();
    let mut persleep = inner.settings.crawls_per_sleep as i64;
    let mut items_since_write: u32 = 0;

    // Acquiring the iterator can wait out a bucket lock, and fails
    // outright while the table is expanding.
    let mut iter = match inner.cache.try_hash_iter() {
        Some(iter) => iter,
        None => {
            if let Some(active) = st.active.as_mut() {
                active.module.set_locked();
            }
            return;
        }
    };

    loop {
        match iter.step() {
            IterStep::Done => break,
            IterStep::Bucket => {
                // Between buckets: no locks held, safe to flush and nap.
                if !st.run_thread {
                    break;
                }
                let active = st.active.as_mut().expect("crawl active");
                if active.client.is_attached() {
                    if items_since_write >= MIN_ITEMS_PER_WRITE {
                        if active.client.flush(inner.router.as_ref()).is_err() {
                            break;
                        }
                        items_since_write = 0;
                    }
                } else if active.ty.needs_client() {
                    break;
                }

                if persleep <= 0 && inner.settings.sleep_us > 0 {
                    MutexGuard::unlocked(st, || {
                        std::thread::sleep(Duration::from_micros(
                            inner.settings.sleep_us as u64,
                        ));
                    });
                    persleep = inner.settings.crawls_per_sleep as i64;
                } else if inner.settings.sleep_us == 0 {
                    MutexGuard::unlocked(st, || {});
                }
            }
            IterStep::Item(id) => {
                let slot = pool.get(id);
                if slot.refcount_incr() < 2 {
                    slot.refcount_decr();
                    continue;
                }
                let active = st.active.as_mut().expect("crawl active");
                // The iterator holds the bucket, so a flush (which can
                // wait on the socket) is off the table; grow instead.
                if active.client.is_attached()
                    && active.client.free_space() < MIN_BUFSPACE
                    && active.client.expand().is_err()
                {
                    slot.refcount_decr();
                    break;
                }
                let mut cx = EvalCx {
                    cache: inner.cache.as_ref(),
                    storage: inner.storage.as_deref(),
                    sink: Some(&mut active.client),
                    class: None,
                    bucket: None,
                };
                active.module.eval(&mut cx, id, 0, 0);
                persleep -= 1;
                items_since_write += 1;
            }
        }
    }
    // Dropping the iterator unpins the table; without this, expansion
    // would stay blocked.
    drop(iter);
}

fn finish_crawl(inner: &CrawlerInner, st: &mut MutexGuard<'_, CrawlState>) {
    let Some(mut active) = st.active.take() else {
        return;
    };
    active
        .module
        .finalize(inner.cache.clock(), &mut active.client, inner.router.as_ref());
    while active.client.is_attached() && active.client.used() != 0 {
        if active.client.flush(inner.router.as_ref()).is_err() {
            break;
        }
    }
    if active.client.is_attached() {
        active.client.release(inner.router.as_ref());
    }
}

fn class_done(inner: &CrawlerInner, st: &mut MutexGuard<'_, CrawlState>, class: usize) {
    let guard = inner.cache.class(class).lock();
    class_done_locked(inner, st, guard, class);
}

fn class_done_locked(
    inner: &CrawlerInner,
    st: &mut MutexGuard<'_, CrawlState>,
    mut guard: ClassGuard<'_>,
    class: usize,
) {
    let counters = guard.crawl_end(inner.cache.pool());
    drop(guard);
    inner.cache.stats_add_crawl(class, counters);
    st.tocrawl -= 1;
    if let Some(active) = st.active.as_mut() {
        active.module.doneclass(inner.cache.clock(), class);
    }
}
