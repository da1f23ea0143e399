//! Request cache with explicit freshness contracts.
//!
//! # Design
//!
//! Every entry carries three deadlines computed when it is written:
//! `written_at <= fresh_until <= evict_at`. A read before `fresh_until` is
//! fresh and never triggers a refetch. A read after it is still served but
//! reported stale, so the caller knows a background reconciliation is due.
//! After `evict_at` the entry is gone. Reads and writes push `evict_at`
//! forward, so only entries nobody touches for the gc window are dropped.
//!
//! Entries removed by an invalidation sweep leave their value behind as a
//! placeholder. Placeholders are never returned by [`RequestCache::get`],
//! only by [`RequestCache::read_with_placeholder`], which lets a display
//! keep showing the last known price while the refetch is pending.
//!
//! # Example
//!
//! ```ignore
//! let cache = RequestCache::new(&config, Arc::new(SystemTimeSource));
//!
//! match cache.get(&key)? {
//!     Lookup::Hit(read) if read.is_fresh() => show(read.value()),
//!     Lookup::Hit(read) => { show(read.value()); refresh(&key) }
//!     Lookup::Miss(reason) => fetch(&key, reason),
//! }
//! ```

pub mod entry;
pub mod freshness;
pub mod stats;
pub mod store;

pub use entry::CacheEntry;
pub use freshness::{CacheRead, ReadState};
pub use stats::CacheStats;
pub use store::{CommitOutcome, Lookup, MissReason, RequestCache};
