//! scour-crawler: the background LRU sweeper.
//!
//! A single worker thread walks the cache's per-class LRU chains (or the
//! whole hash table) off the request path, driving one of a small set of
//! modes:
//!
//! - **Expired / Autoexpire**: reap expired, flushed, and invalid items,
//!   keeping per-class TTL histograms
//! - **Metadump**: stream one verbose metadata line per live key to an
//!   attached client
//! - **Mgdump**: stream compact `mg <key>` lines to an attached client
//!
//! The [`LruCrawler`] controller starts, stops, and paces the worker;
//! see the crate's integration tests for end-to-end usage against real
//! sockets.

mod client;
mod controller;
mod encode;
mod error;
mod modes;
mod settings;
mod storage;
mod worker;

pub use client::{
    AttachError, ClientSink, ConnRouter, CrawlerClient, DropRouter, FlushStatus, MIN_BUFSPACE,
    SinkClosed,
};
pub use controller::{CAP_REMAINING, CrawlerPause, LruCrawler};
pub use error::{CrawlOutcome, StartError};
pub use modes::CrawlType;
pub use modes::expired::{ClassExpireStats, ExpiredStats, ExpiredSummary, HISTO_BUCKETS};
pub use settings::CrawlerSettings;
pub use storage::ExtStorage;
