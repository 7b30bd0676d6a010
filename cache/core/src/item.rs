//! Item slots and the refcount lifetime protocol.
//!
//! An [`ItemSlot`] is one entry in the item pool. Metadata lives in
//! atomics so concurrent readers holding a reference never race the
//! writers that mutate chain links under the appropriate locks. The key
//! and payload are written exactly once, when the pool hands the slot out,
//! and are only read by callers that hold a reference to the item (either
//! the chain's own reference or a successfully bumped refcount), so the
//! slot can never be recycled out from under them.

use crate::sync::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::cell::UnsafeCell;

/// Item flag bits.
pub mod flag {
    /// Item is linked into the hash table and an LRU chain.
    pub const LINKED: u16 = 1 << 0;
    /// Item has been fetched at least once since it was stored.
    pub const FETCHED: u16 = 1 << 1;
    /// Key contains arbitrary bytes and must be base64-encoded on dump.
    pub const KEY_BINARY: u16 = 1 << 2;
    /// Payload lives in the external storage tier; the in-memory payload
    /// is a page/offset descriptor.
    pub const EXT_HDR: u16 = 1 << 3;
}

/// Maximum key length in bytes.
///
/// Also what keeps a single dump line under the sink's minimum buffer
/// headroom: a fully URI-encoded key is at most `3 * KEY_MAX_LEN` bytes.
pub const KEY_MAX_LEN: usize = 250;

/// Fixed per-item overhead charged to an item's total size.
pub const ITEM_OVERHEAD: u32 = 48;

/// Location descriptor for an item whose payload lives in the external
/// storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtHeader {
    /// Storage page holding the payload.
    pub page_id: u32,
    /// Byte offset within the page.
    pub offset: u32,
}

impl ExtHeader {
    /// Serialized size of the descriptor at the front of the payload.
    pub const SIZE: usize = 8;

    /// Encode into the payload prefix layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Decode from a payload prefix.
    ///
    /// Byte-wise copies, so the payload does not need any particular
    /// alignment.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        let mut page = [0u8; 4];
        let mut offset = [0u8; 4];
        page.copy_from_slice(&data[0..4]);
        offset.copy_from_slice(&data[4..8]);
        Some(Self {
            page_id: u32::from_le_bytes(page),
            offset: u32::from_le_bytes(offset),
        })
    }
}

/// One entry in the item pool.
///
/// Chain links (`next`/`prev`) are only mutated under the owning class
/// lock; the hash link (`h_next`) only under the owning bucket lock.
pub struct ItemSlot {
    next: AtomicU32,
    prev: AtomicU32,
    h_next: AtomicU32,
    refcount: AtomicU32,
    flags: AtomicU16,
    clsid: AtomicU8,
    exptime: AtomicU32,
    time: AtomicU32,
    cas: AtomicU64,
    client_flags: AtomicU64,
    total_size: AtomicU32,
    key: UnsafeCell<Box<[u8]>>,
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the UnsafeCell contents are written only by `init()` while the
// slot is free (refcount 0, unlinked, owned by the pool's free list), and
// read only by callers holding a reference per the refcount protocol, so
// reads and writes can never overlap.
unsafe impl Sync for ItemSlot {}

impl ItemSlot {
    pub(crate) fn empty() -> Self {
        Self {
            next: AtomicU32::new(crate::pool::NONE),
            prev: AtomicU32::new(crate::pool::NONE),
            h_next: AtomicU32::new(crate::pool::NONE),
            refcount: AtomicU32::new(0),
            flags: AtomicU16::new(0),
            clsid: AtomicU8::new(0),
            exptime: AtomicU32::new(0),
            time: AtomicU32::new(0),
            cas: AtomicU64::new(0),
            client_flags: AtomicU64::new(0),
            total_size: AtomicU32::new(0),
            key: UnsafeCell::new(Box::from(&[][..])),
            data: UnsafeCell::new(Box::from(&[][..])),
        }
    }

    /// Populate a freshly allocated slot. Called by the pool only, while
    /// the slot is off every chain with refcount 0.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn init(
        &self,
        key: &[u8],
        data: &[u8],
        exptime: u32,
        time: u32,
        cas: u64,
        clsid: u8,
        flags: u16,
        client_flags: u64,
    ) {
        // SAFETY: see the Sync impl; the pool guarantees exclusivity here.
        unsafe {
            *self.key.get() = Box::from(key);
            *self.data.get() = Box::from(data);
        }
        self.exptime.store(exptime, Ordering::Relaxed);
        self.time.store(time, Ordering::Relaxed);
        self.cas.store(cas, Ordering::Relaxed);
        self.clsid.store(clsid, Ordering::Relaxed);
        self.client_flags.store(client_flags, Ordering::Relaxed);
        self.total_size.store(
            ITEM_OVERHEAD + key.len() as u32 + data.len() as u32,
            Ordering::Relaxed,
        );
        self.flags.store(flags, Ordering::Relaxed);
        self.next.store(crate::pool::NONE, Ordering::Relaxed);
        self.prev.store(crate::pool::NONE, Ordering::Relaxed);
        self.h_next.store(crate::pool::NONE, Ordering::Relaxed);
        self.refcount.store(1, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        debug_assert_eq!(self.refcount.load(Ordering::Relaxed), 0);
        self.flags.store(0, Ordering::Relaxed);
    }

    /// The item's key.
    ///
    /// Callers must hold a reference to the item (chain reference under
    /// the class lock, or a bumped refcount).
    #[inline]
    pub fn key(&self) -> &[u8] {
        // SAFETY: see the Sync impl.
        unsafe { &*self.key.get() }
    }

    /// The item's payload bytes.
    ///
    /// Same reference requirement as [`ItemSlot::key`].
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: see the Sync impl.
        unsafe { &*self.data.get() }
    }

    /// The external-storage descriptor, for `EXT_HDR` items.
    pub fn ext_header(&self) -> Option<ExtHeader> {
        if !self.has_flag(flag::EXT_HDR) {
            return None;
        }
        ExtHeader::from_bytes(self.data())
    }

    /// Bump the refcount, returning the new value.
    #[inline]
    pub fn refcount_incr(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference, returning the new value.
    #[inline]
    pub fn refcount_decr(&self) -> u32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    /// Current refcount.
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// All flag bits.
    #[inline]
    pub fn flags(&self) -> u16 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Whether a flag bit is set.
    #[inline]
    pub fn has_flag(&self, bit: u16) -> bool {
        self.flags() & bit != 0
    }

    pub(crate) fn set_flag(&self, bit: u16) {
        self.flags.fetch_or(bit, Ordering::Relaxed);
    }

    pub(crate) fn clear_flag(&self, bit: u16) {
        self.flags.fetch_and(!bit, Ordering::Relaxed);
    }

    /// Expiration time, relative seconds; 0 means never.
    #[inline]
    pub fn exptime(&self) -> u32 {
        self.exptime.load(Ordering::Relaxed)
    }

    /// Last-access time, relative seconds.
    #[inline]
    pub fn last_access(&self) -> u32 {
        self.time.load(Ordering::Relaxed)
    }

    /// CAS value.
    #[inline]
    pub fn cas(&self) -> u64 {
        self.cas.load(Ordering::Relaxed)
    }

    /// Opaque client flag bits.
    #[inline]
    pub fn client_flags(&self) -> u64 {
        self.client_flags.load(Ordering::Relaxed)
    }

    /// Class id, including the sub-LRU bits.
    #[inline]
    pub fn clsid(&self) -> u8 {
        self.clsid.load(Ordering::Relaxed)
    }

    /// Total accounted size in bytes.
    #[inline]
    pub fn total_size(&self) -> u32 {
        self.total_size.load(Ordering::Relaxed)
    }

    /// Whether the item is expired at coarse time `now`.
    #[inline]
    pub fn is_expired(&self, now: u32) -> bool {
        let exp = self.exptime();
        exp != 0 && exp < now
    }

    // Chain link accessors; callers hold the guarding lock.

    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_next(&self, id: u32) {
        self.next.store(id, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_prev(&self, id: u32) {
        self.prev.store(id, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn h_next(&self) -> u32 {
        self.h_next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_h_next(&self, id: u32) {
        self.h_next.store(id, Ordering::Relaxed);
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn slot_with(key: &[u8], data: &[u8], flags: u16) -> ItemSlot {
        let slot = ItemSlot::empty();
        slot.init(key, data, 0, 0, 1, 0, flags, 0);
        slot
    }

    #[test]
    fn test_init_populates_fields() {
        let slot = ItemSlot::empty();
        slot.init(b"hello", b"world", 30, 5, 99, 7, flag::LINKED, 0xAB);
        assert_eq!(slot.key(), b"hello");
        assert_eq!(slot.data(), b"world");
        assert_eq!(slot.exptime(), 30);
        assert_eq!(slot.last_access(), 5);
        assert_eq!(slot.cas(), 99);
        assert_eq!(slot.clsid(), 7);
        assert_eq!(slot.client_flags(), 0xAB);
        assert_eq!(slot.refcount(), 1);
        assert!(slot.has_flag(flag::LINKED));
        assert_eq!(slot.total_size(), ITEM_OVERHEAD + 5 + 5);
    }

    #[test]
    fn test_refcount_protocol() {
        let slot = slot_with(b"k", b"", flag::LINKED);
        assert_eq!(slot.refcount(), 1);
        assert_eq!(slot.refcount_incr(), 2);
        assert_eq!(slot.refcount_decr(), 1);
    }

    #[test]
    fn test_expiry() {
        let slot = slot_with(b"k", b"", 0);
        assert!(!slot.is_expired(1_000_000), "exptime 0 never expires");

        let slot = ItemSlot::empty();
        slot.init(b"k", b"", 100, 0, 1, 0, 0, 0);
        assert!(!slot.is_expired(99));
        assert!(!slot.is_expired(100));
        assert!(slot.is_expired(101));
    }

    #[test]
    fn test_ext_header_round_trip() {
        let hdr = ExtHeader {
            page_id: 0x01020304,
            offset: 0xA0B0C0D0,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(ExtHeader::from_bytes(&bytes), Some(hdr));
    }

    #[test]
    fn test_ext_header_requires_flag() {
        let hdr = ExtHeader {
            page_id: 3,
            offset: 9,
        };
        let plain = slot_with(b"k", &hdr.to_bytes(), 0);
        assert_eq!(plain.ext_header(), None);

        let ext = slot_with(b"k", &hdr.to_bytes(), flag::EXT_HDR);
        assert_eq!(ext.ext_header(), Some(hdr));
    }

    #[test]
    fn test_ext_header_short_payload() {
        let ext = slot_with(b"k", b"tiny", flag::EXT_HDR);
        assert_eq!(ext.ext_header(), None);
    }

    #[test]
    fn test_flag_set_clear() {
        let slot = slot_with(b"k", b"", flag::LINKED);
        slot.set_flag(flag::FETCHED);
        assert!(slot.has_flag(flag::FETCHED));
        slot.clear_flag(flag::LINKED);
        assert!(!slot.has_flag(flag::LINKED));
        assert!(slot.has_flag(flag::FETCHED));
    }
}
