//! Cache facade tying the pool, class chains, and hash table together.
//!
//! Implements just enough of the request surface (store, delete, lookup,
//! flush epoch) for the sweeping machinery to be exercised end to end.
//! Request-path operations lock the bucket stripe first and the class
//! second; a sweeper must therefore take the class lock first and only
//! *try* the bucket stripe.

use crate::class::{CrawlCounters, LruClass, POWER_LARGEST};
use crate::clock::Clock;
use crate::error::{CacheError, CacheResult};
use crate::hashtable::{BucketGuard, HashTable};
use crate::item::{ExtHeader, KEY_MAX_LEN, flag};
use crate::pool::ItemPool;
use crate::sync::{AtomicU32, AtomicU64, Ordering};
use crate::{ClassGuard, HashIter};
use std::sync::Arc;

/// Sizing knobs for a [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Item slot capacity.
    pub max_items: usize,
    /// log2 of the hash bucket count.
    pub hash_power: u8,
    /// log2 of the bucket lock stripe count.
    pub lock_power: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 65536,
            hash_power: 16,
            lock_power: 10,
        }
    }
}

/// Optional attributes for a store.
#[derive(Debug, Clone, Default)]
pub struct Insert {
    /// Expiration, relative coarse seconds; 0 = never.
    pub exptime: u32,
    /// Target LRU chain (class id with sub-LRU bits).
    pub class: u8,
    /// Key holds arbitrary bytes.
    pub key_binary: bool,
    /// Payload is an external-storage descriptor.
    pub ext: Option<ExtHeader>,
    /// Opaque client flag bits.
    pub client_flags: u64,
    /// Payload bytes (ignored when `ext` is set).
    pub data: Vec<u8>,
}

/// A point-in-time copy of an item's metadata.
#[derive(Debug, Clone)]
pub struct ItemMeta {
    /// Expiration, relative coarse seconds; 0 = never.
    pub exptime: u32,
    /// Last-access time, relative coarse seconds.
    pub last_access: u32,
    /// CAS value.
    pub cas: u64,
    /// Flag bits.
    pub flags: u16,
    /// Class id with sub-LRU bits.
    pub class: u8,
    /// Total accounted size.
    pub total_size: u32,
    /// Opaque client flag bits.
    pub client_flags: u64,
    /// Refcount at snapshot time.
    pub refcount: u32,
}

/// Lifetime totals the sweeper reports per class when it finishes one.
#[derive(Debug, Default)]
struct CrawlTotal {
    reclaimed: AtomicU64,
    unfetched: AtomicU64,
    checked: AtomicU64,
}

/// The in-memory cache the sweeper walks.
pub struct Cache {
    pool: ItemPool,
    classes: Box<[LruClass]>,
    table: HashTable,
    clock: Arc<Clock>,
    flush_epoch: AtomicU32,
    cas_source: AtomicU64,
    crawl_totals: Box<[CrawlTotal]>,
}

impl Cache {
    /// Build a cache.
    pub fn new(config: CacheConfig, clock: Arc<Clock>) -> Self {
        Self {
            pool: ItemPool::with_capacity(config.max_items),
            classes: (0..POWER_LARGEST).map(|_| LruClass::new()).collect(),
            table: HashTable::new(config.hash_power, config.lock_power),
            clock,
            flush_epoch: AtomicU32::new(0),
            cas_source: AtomicU64::new(0),
            crawl_totals: (0..POWER_LARGEST).map(|_| CrawlTotal::default()).collect(),
        }
    }

    /// The pool backing this cache's items.
    pub fn pool(&self) -> &ItemPool {
        &self.pool
    }

    /// The hash table.
    pub fn table(&self) -> &HashTable {
        &self.table
    }

    /// The coarse clock items are stamped against.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// One LRU chain.
    pub fn class(&self, id: usize) -> &LruClass {
        &self.classes[id]
    }

    /// Item count in one chain.
    pub fn lru_size(&self, id: usize) -> usize {
        self.classes[id].lock().len()
    }

    /// Hash a key.
    pub fn hash(&self, key: &[u8]) -> u64 {
        self.table.hash(key)
    }

    /// Total live items.
    pub fn len(&self) -> usize {
        self.pool.in_use()
    }

    /// Whether the cache holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store an item, replacing any existing item under the same key.
    pub fn insert(&self, key: &[u8], opts: Insert) -> CacheResult<u32> {
        if key.is_empty() {
            return Err(CacheError::EmptyKey);
        }
        if key.len() > KEY_MAX_LEN {
            return Err(CacheError::KeyTooLong);
        }
        let hv = self.table.hash(key);
        let bucket = self.table.lock_bucket(hv);
        if let Some(old) = self.table.find(&bucket, &self.pool, hv, key) {
            self.unlink_under_bucket(&bucket, hv, old);
        }

        let mut flags = flag::LINKED;
        if opts.key_binary {
            flags |= flag::KEY_BINARY;
        }
        let data;
        if let Some(hdr) = opts.ext {
            flags |= flag::EXT_HDR;
            data = hdr.to_bytes().to_vec();
        } else {
            data = opts.data;
        }
        let cas = self.cas_source.fetch_add(1, Ordering::Relaxed) + 1;
        let id = self.pool.alloc(
            key,
            &data,
            opts.exptime,
            self.clock.now(),
            cas,
            opts.class,
            flags,
            opts.client_flags,
        )?;
        self.table.insert(&bucket, &self.pool, hv, id);
        self.classes[opts.class as usize]
            .lock()
            .link_head(&self.pool, id);
        Ok(id)
    }

    /// Delete by key. Returns whether the key was present.
    pub fn delete(&self, key: &[u8]) -> bool {
        let hv = self.table.hash(key);
        let bucket = self.table.lock_bucket(hv);
        match self.table.find(&bucket, &self.pool, hv, key) {
            Some(id) => {
                self.unlink_under_bucket(&bucket, hv, id);
                true
            }
            None => false,
        }
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.meta(key).is_some()
    }

    /// Metadata snapshot for a key.
    pub fn meta(&self, key: &[u8]) -> Option<ItemMeta> {
        let hv = self.table.hash(key);
        let bucket = self.table.lock_bucket(hv);
        let id = self.table.find(&bucket, &self.pool, hv, key)?;
        let slot = self.pool.get(id);
        Some(ItemMeta {
            exptime: slot.exptime(),
            last_access: slot.last_access(),
            cas: slot.cas(),
            flags: slot.flags(),
            class: slot.clsid(),
            total_size: slot.total_size(),
            client_flags: slot.client_flags(),
            refcount: slot.refcount(),
        })
    }

    /// Mark an item fetched, as a read on the request path would.
    pub fn touch_fetched(&self, key: &[u8]) -> bool {
        let hv = self.table.hash(key);
        let bucket = self.table.lock_bucket(hv);
        match self.table.find(&bucket, &self.pool, hv, key) {
            Some(id) => {
                self.pool.get(id).set_flag(flag::FETCHED);
                true
            }
            None => false,
        }
    }

    /// Retroactively invalidate everything stored at or before now.
    pub fn flush_all(&self) {
        self.flush_epoch.store(self.clock.now(), Ordering::Relaxed);
    }

    /// Whether an item predates the flush epoch.
    pub fn item_is_flushed(&self, id: u32) -> bool {
        let epoch = self.flush_epoch.load(Ordering::Relaxed);
        epoch != 0 && self.pool.get(id).last_access() <= epoch
    }

    /// Unlink an item while the caller already holds both its class lock
    /// and its bucket stripe, as the reap path does. Drops the chain's
    /// reference; the caller still owns its own.
    pub fn unlink_nolock(
        &self,
        class: &mut ClassGuard<'_>,
        bucket: &BucketGuard<'_>,
        hv: u64,
        id: u32,
    ) {
        let slot = self.pool.get(id);
        debug_assert!(slot.has_flag(flag::LINKED));
        self.table.remove(bucket, &self.pool, hv, id);
        class.unlink(&self.pool, id);
        slot.clear_flag(flag::LINKED);
        if slot.refcount_decr() == 0 {
            self.pool.free(id);
        }
    }

    /// Drop one reference, freeing the slot when none remain.
    pub fn release(&self, id: u32) {
        if self.pool.get(id).refcount_decr() == 0 {
            self.pool.free(id);
        }
    }

    /// Acquire a hash-walk iterator, unless the table is busy expanding.
    pub fn try_hash_iter(&self) -> Option<HashIter<'_>> {
        self.table.try_iter(&self.pool)
    }

    /// Fold one class's finished crawl counters into the lifetime totals.
    pub fn stats_add_crawl(&self, class: usize, counters: CrawlCounters) {
        let t = &self.crawl_totals[class];
        t.reclaimed.fetch_add(counters.reclaimed, Ordering::Relaxed);
        t.unfetched.fetch_add(counters.unfetched, Ordering::Relaxed);
        t.checked.fetch_add(counters.checked, Ordering::Relaxed);
    }

    /// Lifetime crawl totals for one class.
    pub fn crawl_totals(&self, class: usize) -> CrawlCounters {
        let t = &self.crawl_totals[class];
        CrawlCounters {
            reclaimed: t.reclaimed.load(Ordering::Relaxed),
            unfetched: t.unfetched.load(Ordering::Relaxed),
            checked: t.checked.load(Ordering::Relaxed),
        }
    }

    // Removes from hash + chain + drops the chain reference. Caller
    // holds the bucket stripe for `hv`.
    fn unlink_under_bucket(&self, bucket: &BucketGuard<'_>, hv: u64, id: u32) {
        let slot = self.pool.get(id);
        let class = slot.clsid() as usize;
        let mut guard = self.classes[class].lock();
        self.table.remove(bucket, &self.pool, hv, id);
        guard.unlink(&self.pool, id);
        slot.clear_flag(flag::LINKED);
        drop(guard);
        if slot.refcount_decr() == 0 {
            self.pool.free(id);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn cache() -> Cache {
        Cache::new(
            CacheConfig {
                max_items: 128,
                hash_power: 8,
                lock_power: 4,
            },
            Arc::new(Clock::new()),
        )
    }

    #[test]
    fn test_insert_and_meta() {
        let cache = cache();
        cache.clock().advance(10);
        cache
            .insert(
                b"k1",
                Insert {
                    exptime: 90,
                    class: 5,
                    client_flags: 0xF00D,
                    ..Default::default()
                },
            )
            .unwrap();
        let meta = cache.meta(b"k1").expect("present");
        assert_eq!(meta.exptime, 90);
        assert_eq!(meta.last_access, 10);
        assert_eq!(meta.class, 5);
        assert_eq!(meta.client_flags, 0xF00D);
        assert_eq!(meta.refcount, 1, "idle linked item holds one reference");
        assert_eq!(cache.lru_size(5), 1);
    }

    #[test]
    fn test_insert_replaces() {
        let cache = cache();
        cache.insert(b"k1", Insert::default()).unwrap();
        let first = cache.meta(b"k1").unwrap().cas;
        cache.insert(b"k1", Insert::default()).unwrap();
        let second = cache.meta(b"k1").unwrap().cas;
        assert!(second > first, "cas advances on replace");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lru_size(0), 1);
    }

    #[test]
    fn test_delete() {
        let cache = cache();
        cache.insert(b"k1", Insert::default()).unwrap();
        assert!(cache.delete(b"k1"));
        assert!(!cache.delete(b"k1"));
        assert!(!cache.contains(b"k1"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_key_limits() {
        let cache = cache();
        assert_eq!(
            cache.insert(b"", Insert::default()),
            Err(CacheError::EmptyKey)
        );
        let long = vec![b'x'; KEY_MAX_LEN + 1];
        assert_eq!(
            cache.insert(&long, Insert::default()),
            Err(CacheError::KeyTooLong)
        );
        let edge = vec![b'x'; KEY_MAX_LEN];
        assert!(cache.insert(&edge, Insert::default()).is_ok());
    }

    #[test]
    fn test_flush_epoch() {
        let cache = cache();
        cache.clock().advance(5);
        let old = cache.insert(b"old", Insert::default()).unwrap();
        cache.clock().advance(5);
        cache.flush_all();
        cache.clock().advance(5);
        let new = cache.insert(b"new", Insert::default()).unwrap();
        assert!(cache.item_is_flushed(old));
        assert!(!cache.item_is_flushed(new));
    }

    #[test]
    fn test_touch_fetched() {
        let cache = cache();
        cache.insert(b"k1", Insert::default()).unwrap();
        assert_eq!(cache.meta(b"k1").unwrap().flags & flag::FETCHED, 0);
        assert!(cache.touch_fetched(b"k1"));
        assert_ne!(cache.meta(b"k1").unwrap().flags & flag::FETCHED, 0);
    }

    #[test]
    fn test_crawl_totals_accumulate() {
        let cache = cache();
        cache.stats_add_crawl(
            3,
            CrawlCounters {
                reclaimed: 2,
                unfetched: 1,
                checked: 5,
            },
        );
        cache.stats_add_crawl(
            3,
            CrawlCounters {
                reclaimed: 1,
                unfetched: 0,
                checked: 4,
            },
        );
        let totals = cache.crawl_totals(3);
        assert_eq!(totals.reclaimed, 3);
        assert_eq!(totals.unfetched, 1);
        assert_eq!(totals.checked, 9);
    }

    #[test]
    fn test_ext_items() {
        let cache = cache();
        cache
            .insert(
                b"hdr",
                Insert {
                    ext: Some(ExtHeader {
                        page_id: 7,
                        offset: 4096,
                    }),
                    ..Default::default()
                },
            )
            .unwrap();
        let meta = cache.meta(b"hdr").unwrap();
        assert_ne!(meta.flags & flag::EXT_HDR, 0);
    }
}
