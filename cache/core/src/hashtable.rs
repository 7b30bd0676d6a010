//! Bucket-chained hash table over item ids.
//!
//! Buckets are singly-linked chains through each item's hash link.
//! Mutation requires the bucket's lock stripe; the stripe count divides
//! the bucket count so a stripe guard covers every bucket it maps to.
//!
//! Request handlers lock the bucket first and a class lock second. The
//! crawler holds a class lock when it reaches for a bucket, so it may
//! only *try* the stripe; blocking here would invert the order and
//! deadlock against the request path.
//!
//! Iteration follows the walker protocol: an iterator pins the table
//! against expansion for its lifetime, visits every bucket in order,
//! yields each item with its stripe locked, and reports bucket
//! boundaries so callers can do unlocked housekeeping between them.

use crate::pool::{ItemPool, NONE};
use crate::sync::{AtomicBool, AtomicU32, Ordering};
use ahash::RandomState;
use parking_lot::{Mutex, MutexGuard};
use std::hash::{BuildHasher, Hash, Hasher};

/// Bucket-chained hash table addressing items by id.
pub struct HashTable {
    buckets: Box<[AtomicU32]>,
    mask: u64,
    locks: Box<[Mutex<()>]>,
    lock_mask: u64,
    hasher: RandomState,
    expanding: AtomicBool,
    iter_pinned: AtomicBool,
}

/// Proof that a bucket's lock stripe is held.
pub struct BucketGuard<'a> {
    stripe: usize,
    _guard: MutexGuard<'a, ()>,
}

impl HashTable {
    /// Create a table with `1 << hash_power` buckets and
    /// `1 << lock_power` lock stripes.
    pub fn new(hash_power: u8, lock_power: u8) -> Self {
        assert!(lock_power <= hash_power, "more stripes than buckets");
        let nbuckets = 1usize << hash_power;
        let nlocks = 1usize << lock_power;
        Self {
            buckets: (0..nbuckets).map(|_| AtomicU32::new(NONE)).collect(),
            mask: (nbuckets - 1) as u64,
            locks: (0..nlocks).map(|_| Mutex::new(())).collect(),
            lock_mask: (nlocks - 1) as u64,
            hasher: RandomState::new(),
            expanding: AtomicBool::new(false),
            iter_pinned: AtomicBool::new(false),
        }
    }

    /// Hash a key.
    pub fn hash(&self, key: &[u8]) -> u64 {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        h.finish()
    }

    fn bucket_index(&self, hv: u64) -> usize {
        (hv & self.mask) as usize
    }

    fn stripe_index(&self, hv: u64) -> usize {
        // lock_mask is a subset of mask, so this is also the stripe of
        // the bucket index itself.
        (hv & self.lock_mask) as usize
    }

    /// Number of buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Lock the bucket stripe for `hv`, blocking. Request-path order:
    /// bucket before class.
    pub fn lock_bucket(&self, hv: u64) -> BucketGuard<'_> {
        let stripe = self.stripe_index(hv);
        BucketGuard {
            stripe,
            _guard: self.locks[stripe].lock(),
        }
    }

    /// Try to lock the bucket stripe for `hv`. The crawler's only entry
    /// point, since it already holds a class lock.
    pub fn try_lock_bucket(&self, hv: u64) -> Option<BucketGuard<'_>> {
        let stripe = self.stripe_index(hv);
        self.locks[stripe]
            .try_lock()
            .map(|guard| BucketGuard {
                stripe,
                _guard: guard,
            })
    }

    /// Link an item into its bucket chain.
    pub fn insert(&self, guard: &BucketGuard<'_>, pool: &ItemPool, hv: u64, id: u32) {
        debug_assert_eq!(guard.stripe, self.stripe_index(hv));
        let bucket = &self.buckets[self.bucket_index(hv)];
        let head = bucket.load(Ordering::Relaxed);
        pool.get(id).set_h_next(head);
        bucket.store(id, Ordering::Relaxed);
    }

    /// Unlink an item from its bucket chain. Returns whether it was
    /// present.
    pub fn remove(&self, guard: &BucketGuard<'_>, pool: &ItemPool, hv: u64, id: u32) -> bool {
        debug_assert_eq!(guard.stripe, self.stripe_index(hv));
        let bucket = &self.buckets[self.bucket_index(hv)];
        let mut cur = bucket.load(Ordering::Relaxed);
        if cur == id {
            bucket.store(pool.get(id).h_next(), Ordering::Relaxed);
            pool.get(id).set_h_next(NONE);
            return true;
        }
        while cur != NONE {
            let next = pool.get(cur).h_next();
            if next == id {
                pool.get(cur).set_h_next(pool.get(id).h_next());
                pool.get(id).set_h_next(NONE);
                return true;
            }
            cur = next;
        }
        false
    }

    /// Find an item by key in its bucket chain.
    pub fn find(&self, guard: &BucketGuard<'_>, pool: &ItemPool, hv: u64, key: &[u8]) -> Option<u32> {
        debug_assert_eq!(guard.stripe, self.stripe_index(hv));
        let mut cur = self.buckets[self.bucket_index(hv)].load(Ordering::Relaxed);
        while cur != NONE {
            let slot = pool.get(cur);
            if slot.key() == key {
                return Some(cur);
            }
            cur = slot.h_next();
        }
        None
    }

    /// Mark the table as expanding. Fails while an iterator pins the
    /// table. While set, no new iterator can start.
    pub fn begin_expansion(&self) -> bool {
        if self.iter_pinned.load(Ordering::Acquire) {
            return false;
        }
        self.expanding.store(true, Ordering::Release);
        true
    }

    /// Clear the expansion mark.
    pub fn end_expansion(&self) {
        self.expanding.store(false, Ordering::Release);
    }

    /// Acquire a walking iterator.
    ///
    /// Returns `None` when the table is expanding or another iterator is
    /// live. A live iterator blocks expansion until dropped.
    pub fn try_iter<'a>(&'a self, pool: &'a ItemPool) -> Option<HashIter<'a>> {
        if self.expanding.load(Ordering::Acquire) {
            return None;
        }
        if self.iter_pinned.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(HashIter {
            table: self,
            pool,
            bucket: 0,
            cur: NONE,
            guard: None,
        })
    }
}

/// One step of a hash walk.
#[derive(Debug)]
pub enum IterStep {
    /// An item, yielded with its bucket stripe locked by the iterator.
    Item(u32),
    /// Between buckets; no locks held. Housekeeping may run.
    Bucket,
    /// Walk complete.
    Done,
}

/// A cursor over every bucket chain.
///
/// Dropping the iterator unpins the table; without that, expansion would
/// stay blocked forever.
pub struct HashIter<'a> {
    table: &'a HashTable,
    pool: &'a ItemPool,
    bucket: usize,
    cur: u32,
    guard: Option<MutexGuard<'a, ()>>,
}

impl HashIter<'_> {
    /// Advance the walk one step.
    pub fn step(&mut self) -> IterStep {
        if self.guard.is_none() {
            if self.bucket >= self.table.bucket_count() {
                return IterStep::Done;
            }
            let stripe = (self.bucket as u64 & self.table.lock_mask) as usize;
            self.guard = Some(self.table.locks[stripe].lock());
            self.cur = self.table.buckets[self.bucket].load(Ordering::Relaxed);
        }
        if self.cur != NONE {
            let id = self.cur;
            self.cur = self.pool.get(id).h_next();
            return IterStep::Item(id);
        }
        self.guard = None;
        self.bucket += 1;
        IterStep::Bucket
    }
}

impl Drop for HashIter<'_> {
    fn drop(&mut self) {
        self.guard = None;
        self.table.iter_pinned.store(false, Ordering::Release);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::item::flag;

    fn setup(keys: &[&[u8]]) -> (ItemPool, HashTable, Vec<u32>) {
        let pool = ItemPool::with_capacity(keys.len().max(1));
        let table = HashTable::new(6, 4);
        let mut ids = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let id = pool
                .alloc(key, b"", 0, 0, i as u64, 1, flag::LINKED, 0)
                .unwrap();
            let hv = table.hash(key);
            let guard = table.lock_bucket(hv);
            table.insert(&guard, &pool, hv, id);
            ids.push(id);
        }
        (pool, table, ids)
    }

    #[test]
    fn test_insert_find_remove() {
        let (pool, table, ids) = setup(&[b"alpha", b"beta", b"gamma"]);
        let hv = table.hash(b"beta");
        let guard = table.lock_bucket(hv);
        assert_eq!(table.find(&guard, &pool, hv, b"beta"), Some(ids[1]));
        assert!(table.remove(&guard, &pool, hv, ids[1]));
        assert_eq!(table.find(&guard, &pool, hv, b"beta"), None);
        assert!(!table.remove(&guard, &pool, hv, ids[1]));
    }

    #[test]
    fn test_find_missing() {
        let (pool, table, _) = setup(&[b"alpha"]);
        let hv = table.hash(b"nope");
        let guard = table.lock_bucket(hv);
        assert_eq!(table.find(&guard, &pool, hv, b"nope"), None);
    }

    #[test]
    fn test_trylock_contention() {
        let (_pool, table, _) = setup(&[b"alpha"]);
        let hv = table.hash(b"alpha");
        let held = table.lock_bucket(hv);
        assert!(table.try_lock_bucket(hv).is_none());
        drop(held);
        assert!(table.try_lock_bucket(hv).is_some());
    }

    #[test]
    fn test_iterator_visits_everything() {
        let keys: Vec<Vec<u8>> = (0..32).map(|i| format!("key{i}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let (pool, table, ids) = setup(&refs);

        let mut seen = Vec::new();
        let mut iter = table.try_iter(&pool).expect("iterator available");
        loop {
            match iter.step() {
                IterStep::Item(id) => seen.push(id),
                IterStep::Bucket => continue,
                IterStep::Done => break,
            }
        }
        seen.sort_unstable();
        let mut expected = ids.clone();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_iterator_pins_expansion() {
        let (pool, table, _) = setup(&[b"alpha"]);
        let iter = table.try_iter(&pool).expect("iterator available");
        assert!(!table.begin_expansion(), "expansion blocked while walking");
        drop(iter);
        assert!(table.begin_expansion());
        table.end_expansion();
    }

    #[test]
    fn test_expansion_blocks_iterator() {
        let (pool, table, _) = setup(&[b"alpha"]);
        assert!(table.begin_expansion());
        assert!(table.try_iter(&pool).is_none());
        table.end_expansion();
        assert!(table.try_iter(&pool).is_some());
    }

    #[test]
    fn test_single_iterator_at_a_time() {
        let (pool, table, _) = setup(&[b"alpha"]);
        let first = table.try_iter(&pool).expect("iterator available");
        assert!(table.try_iter(&pool).is_none());
        drop(first);
        assert!(table.try_iter(&pool).is_some());
    }
}
