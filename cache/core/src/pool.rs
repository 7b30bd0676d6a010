//! Fixed-capacity item pool.
//!
//! Items are addressed by `u32` id so chain links are plain integers
//! rather than pointers. Two ids are reserved: [`NONE`] terminates chains
//! and [`CURSOR`] names the per-class crawl cursor, which participates in
//! chain links without occupying a slot.

use crate::error::{CacheError, CacheResult};
use crate::item::ItemSlot;
use parking_lot::Mutex;

/// Chain terminator.
pub const NONE: u32 = u32::MAX;

/// Reserved node id for a class's crawl cursor.
pub const CURSOR: u32 = u32::MAX - 1;

/// Fixed-capacity pool of item slots with a free list.
pub struct ItemPool {
    slots: Box<[ItemSlot]>,
    free: Mutex<Vec<u32>>,
}

impl ItemPool {
    /// Create a pool with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < CURSOR as usize, "pool capacity exceeds id space");
        let slots: Box<[ItemSlot]> = (0..capacity).map(|_| ItemSlot::empty()).collect();
        // Hand out low ids first.
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
        }
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently allocated.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.lock().len()
    }

    /// Fetch a slot by id.
    #[inline]
    pub fn get(&self, id: u32) -> &ItemSlot {
        &self.slots[id as usize]
    }

    /// Allocate and populate a slot. The returned item carries one
    /// reference (the caller's, which becomes the chain's on link).
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &self,
        key: &[u8],
        data: &[u8],
        exptime: u32,
        time: u32,
        cas: u64,
        clsid: u8,
        flags: u16,
        client_flags: u64,
    ) -> CacheResult<u32> {
        let id = self.free.lock().pop().ok_or(CacheError::OutOfMemory)?;
        self.slots[id as usize].init(key, data, exptime, time, cas, clsid, flags, client_flags);
        Ok(id)
    }

    /// Return a slot to the free list. The slot must be unlinked with a
    /// refcount of zero.
    pub fn free(&self, id: u32) {
        self.slots[id as usize].clear();
        self.free.lock().push(id);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::item::flag;

    #[test]
    fn test_alloc_free_reuse() {
        let pool = ItemPool::with_capacity(2);
        let a = pool.alloc(b"a", b"", 0, 0, 1, 0, flag::LINKED, 0).unwrap();
        let b = pool.alloc(b"b", b"", 0, 0, 2, 0, flag::LINKED, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);

        pool.get(a).refcount_decr();
        pool.free(a);
        assert_eq!(pool.in_use(), 1);

        let c = pool.alloc(b"c", b"", 0, 0, 3, 0, flag::LINKED, 0).unwrap();
        assert_eq!(c, a, "freed slot is reused");
        assert_eq!(pool.get(c).key(), b"c");
    }

    #[test]
    fn test_exhaustion() {
        let pool = ItemPool::with_capacity(1);
        pool.alloc(b"a", b"", 0, 0, 1, 0, 0, 0).unwrap();
        assert_eq!(
            pool.alloc(b"b", b"", 0, 0, 2, 0, 0, 0),
            Err(CacheError::OutOfMemory)
        );
    }

    #[test]
    fn test_reserved_ids_out_of_range() {
        let pool = ItemPool::with_capacity(8);
        let id = pool.alloc(b"a", b"", 0, 0, 1, 0, 0, 0).unwrap();
        assert!(id < CURSOR);
        assert!(id != NONE);
    }
}
