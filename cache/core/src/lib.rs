//! scour-core: cache data structures for the scour sweeper.
//!
//! This crate provides the shared structures a background sweeper walks:
//!
//! - **Clock**: coarse per-process relative time
//! - **Items**: pooled, id-addressed slots with a refcount lifetime scheme
//! - **Classes**: per-class LRU chains with an embedded crawl cursor
//! - **Hashtable**: bucket-chained table with striped locks and a
//!   pinning walk iterator
//! - **Cache**: the facade combining the above with a flush epoch
//!
//! # Locking
//!
//! Request-path operations take a bucket stripe first, then a class
//! lock. Sweepers walk the other way around (class lock first) and so
//! must use [`HashTable::try_lock_bucket`] rather than block.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod class;
mod clock;
mod error;
mod hashtable;
mod item;
mod pool;
pub mod sync;

pub use cache::{Cache, CacheConfig, Insert, ItemMeta};
pub use class::{
    COLD_LRU, ClassGuard, CrawlCounters, CrawlCursor, HOT_LRU, LruClass, MAX_SLAB_CLASSES,
    POWER_LARGEST, TEMP_LRU, WARM_LRU,
};
pub use clock::Clock;
pub use error::{CacheError, CacheResult};
pub use hashtable::{BucketGuard, HashIter, HashTable, IterStep};
pub use item::{ExtHeader, ITEM_OVERHEAD, ItemSlot, KEY_MAX_LEN, flag};
pub use pool::{CURSOR, ItemPool, NONE};
