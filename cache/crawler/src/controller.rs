//! Crawl lifecycle control.
//!
//! A [`LruCrawler`] owns one worker thread and the single active-crawl
//! state. Command handlers and the periodic maintainer start crawls
//! through it; the worker mutates the state only after being signalled,
//! and tears it down before parking again.

use crate::client::{ClientSink, ConnRouter, CrawlerClient, DropRouter};
use crate::error::{CrawlOutcome, StartError};
use crate::modes::expired::ExpiredStats;
use crate::modes::{CrawlType, ModeState};
use crate::settings::CrawlerSettings;
use crate::storage::ExtStorage;
use crate::worker;
use parking_lot::{Condvar, Mutex, MutexGuard};
use scour_core::sync::{AtomicBool, AtomicU64, Ordering};
use scour_core::{COLD_LRU, Cache, HOT_LRU, MAX_SLAB_CLASSES, POWER_LARGEST, TEMP_LRU, WARM_LRU};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Visit-budget value meaning "cap at the class's current size".
pub const CAP_REMAINING: u32 = u32::MAX;

/// `tocrawl` value meaning a hash-table walk instead of class sweeps.
pub(crate) const HASH_WALK: i32 = -1;

/// State behind the crawler mutex.
pub(crate) struct CrawlState {
    /// Worker keep-running flag; cleared to stop.
    pub run_thread: bool,
    /// Classes with a linked cursor, or [`HASH_WALK`].
    pub tocrawl: i32,
    /// The crawl in flight, if any.
    pub active: Option<ActiveCrawl>,
    /// Coarse time before which autoexpire starts are suppressed.
    pub block_autoexpire_until: u32,
}

/// The single active crawl.
pub(crate) struct ActiveCrawl {
    pub ty: CrawlType,
    pub module: ModeState,
    pub client: ClientSink,
}

/// Shared between the controller handle and the worker thread.
pub(crate) struct CrawlerInner {
    pub cache: Arc<Cache>,
    pub settings: CrawlerSettings,
    pub router: Arc<dyn ConnRouter>,
    pub storage: Option<Arc<dyn ExtStorage>>,
    pub state: Mutex<CrawlState>,
    pub cond: Condvar,
    /// A crawl is in flight.
    pub running: AtomicBool,
    /// Lifetime count of crawls started.
    pub starts: AtomicU64,
}

/// Controller for the background sweeper.
pub struct LruCrawler {
    inner: Arc<CrawlerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LruCrawler {
    /// Build a crawler over `cache` with default hooks: finished dump
    /// connections are dropped, no external storage tier.
    pub fn new(cache: Arc<Cache>, settings: CrawlerSettings) -> Self {
        Self::with_hooks(cache, settings, Arc::new(DropRouter), None)
    }

    /// Build a crawler with explicit connection routing and an optional
    /// external storage tier.
    pub fn with_hooks(
        cache: Arc<Cache>,
        settings: CrawlerSettings,
        router: Arc<dyn ConnRouter>,
        storage: Option<Arc<dyn ExtStorage>>,
    ) -> Self {
        Self {
            inner: Arc::new(CrawlerInner {
                cache,
                settings,
                router,
                storage,
                state: Mutex::new(CrawlState {
                    run_thread: false,
                    tocrawl: 0,
                    active: None,
                    block_autoexpire_until: 0,
                }),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                starts: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread.
    ///
    /// Lock dance so the worker is parked on the condition before this
    /// returns: we hold the mutex across the spawn, then wait; the
    /// worker takes the mutex, signals, and waits; our wait cannot
    /// return until the worker's wait has released the mutex.
    pub fn start_worker(&self) -> Result<(), StartError> {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Err(StartError::AlreadyStarted);
        }
        let mut st = self.inner.state.lock();
        st.run_thread = true;
        let inner = Arc::clone(&self.inner);
        let handle = match std::thread::Builder::new()
            .name("item-crawler".into())
            .spawn(move || worker::run(&inner))
        {
            Ok(handle) => handle,
            Err(_) => {
                st.run_thread = false;
                return Err(StartError::Alloc);
            }
        };
        self.inner.cond.wait(&mut st);
        drop(st);
        *slot = Some(handle);
        Ok(())
    }

    /// Ask the worker to exit, optionally joining it.
    pub fn stop_worker(&self, wait: bool) {
        let mut slot = self.worker.lock();
        {
            let mut st = self.inner.state.lock();
            if !st.run_thread {
                return;
            }
            st.run_thread = false;
            self.inner.cond.notify_one();
        }
        if wait {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
    }

    /// Whether a crawl is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Lifetime count of crawls started.
    pub fn starts(&self) -> u64 {
        self.inner.starts.load(Ordering::Relaxed)
    }

    /// Start a crawl.
    ///
    /// `ids` selects the classes to sweep; `None` walks the hash table
    /// instead, which only dump modes may do. `remaining` caps the
    /// candidates visited per class (0 = walk to the head,
    /// [`CAP_REMAINING`] = the class's current size). `data` lets the
    /// caller watch an expired crawl through its own stats block. Modes
    /// that stream output require `client`.
    ///
    /// Returns the number of sweeps started; 0 means nothing matched.
    pub fn start(
        &self,
        ids: Option<&[bool; POWER_LARGEST]>,
        remaining: u32,
        ty: CrawlType,
        data: Option<Arc<ExpiredStats>>,
        client: Option<Box<dyn CrawlerClient>>,
    ) -> Result<u32, StartError> {
        let now = self.inner.cache.clock().now();
        let mut st = self.inner.state.lock();
        let is_running = self.inner.running.load(Ordering::Acquire);
        if !st.run_thread {
            return Err(StartError::NotRunning);
        }

        let autoexpire_pair = ty == CrawlType::Autoexpire
            && st.active.as_ref().map(|a| a.ty) == Some(CrawlType::Autoexpire);
        if is_running && !autoexpire_pair {
            // Any busy rejection arms the suppression window, so a user
            // crawl that preempted the maintainer keeps autoexpire away
            // while it runs.
            st.block_autoexpire_until = now + 60;
            return Err(StartError::Busy);
        }
        if ty == CrawlType::Autoexpire && st.block_autoexpire_until > now {
            return Err(StartError::Busy);
        }
        // The hash walker cannot attribute items to classes, which the
        // reaping modes depend on.
        if ids.is_none() && !ty.is_dump() {
            return Err(StartError::Invalid);
        }

        let mut installed = false;
        if !is_running {
            let module = ModeState::new(ty, data, self.inner.cache.clock());
            let mut sink = ClientSink::new();
            if ty.needs_client() {
                let conn = client.ok_or(StartError::Invalid)?;
                sink.attach(conn).map_err(|_| StartError::Alloc)?;
            }
            st.active = Some(ActiveCrawl {
                ty,
                module,
                client: sink,
            });
            installed = true;
        }

        let mut starts: u32 = 0;
        match ids {
            None => {
                st.tocrawl = HASH_WALK;
                starts = 1;
            }
            Some(map) => {
                // Chain 0 is reserved; sweepable classes start at 1.
                for (class, wanted) in map.iter().enumerate().skip(1) {
                    if *wanted {
                        starts += self.start_class(&mut st, class, remaining);
                    }
                }
            }
        }

        if starts > 0 {
            self.inner.running.store(true, Ordering::Release);
            self.inner.starts.fetch_add(1, Ordering::Relaxed);
            self.inner.cond.notify_one();
        } else if installed {
            // Nothing matched; hand any attached client straight back.
            if let Some(mut active) = st.active.take() {
                if active.client.is_attached() {
                    active.client.release(self.inner.router.as_ref());
                }
            }
        }
        Ok(starts)
    }

    /// `lru_crawler crawl <slabs> [remaining]`: parse the slab list and
    /// start the crawl, mapping the result onto the wire enum.
    pub fn crawl(
        &self,
        slabs: &str,
        ty: CrawlType,
        remaining: u32,
        client: Option<Box<dyn CrawlerClient>>,
    ) -> CrawlOutcome {
        let mut tocrawl = [false; POWER_LARGEST];
        let mut hash_crawl = false;
        if slabs == "all" {
            tocrawl = [true; POWER_LARGEST];
        } else if slabs == "hash" {
            hash_crawl = true;
        } else {
            for part in slabs.split(',') {
                let sid: usize = match part.parse() {
                    Ok(sid) => sid,
                    Err(_) => return CrawlOutcome::Badclass,
                };
                if sid < 1 || sid >= MAX_SLAB_CLASSES {
                    return CrawlOutcome::Badclass;
                }
                tocrawl[sid | TEMP_LRU as usize] = true;
                tocrawl[sid | HOT_LRU as usize] = true;
                tocrawl[sid | WARM_LRU as usize] = true;
                tocrawl[sid | COLD_LRU as usize] = true;
            }
        }
        let ids = if hash_crawl { None } else { Some(&tocrawl) };
        match self.start(ids, remaining, ty, None, client) {
            Ok(0) => CrawlOutcome::Notstarted,
            Ok(_) => CrawlOutcome::Ok,
            Err(StartError::Busy) => CrawlOutcome::Running,
            Err(_) => CrawlOutcome::Error,
        }
    }

    /// Freeze the crawler for the guard's lifetime. While held, the
    /// worker cannot wake or move between items.
    pub fn pause(&self) -> CrawlerPause<'_> {
        CrawlerPause {
            _guard: self.inner.state.lock(),
        }
    }

    // Arm one class's cursor. Returns 1 if a sweep was started, 0 if a
    // cursor was already linked there.
    fn start_class(&self, st: &mut MutexGuard<'_, CrawlState>, class: usize, remaining: u32) -> u32 {
        let pool = self.inner.cache.pool();
        let mut guard = self.inner.cache.class(class).lock();
        if guard.cursor().is_active() {
            return 0;
        }
        debug!(class, "kicking off lru crawl");
        let mut budget = remaining;
        if budget == CAP_REMAINING {
            budget = guard.len() as u32;
        }
        // Budget n visits at most n candidates: the worker decrements
        // before evaluating and stops when the count reaches zero, so a
        // nonzero budget gets one extra notch here.
        if budget != 0 {
            budget = budget.saturating_add(1);
        }
        guard.crawl_begin(pool, budget);
        st.tocrawl += 1;
        1
    }
}

impl Drop for LruCrawler {
    fn drop(&mut self) {
        self.stop_worker(true);
    }
}

/// Holds the crawler mutex, freezing the worker.
pub struct CrawlerPause<'a> {
    _guard: MutexGuard<'a, CrawlState>,
}
