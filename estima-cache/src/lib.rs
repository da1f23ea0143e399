//! estima Cache - Request Cache
//!
//! The single shared mutable store of the pricing engine. Keys are
//! [`StableKey`](estima_core::StableKey)s, values are annotated pricing
//! responses with explicit freshness and eviction deadlines.

pub mod cache;

pub use cache::{
    CacheEntry, CacheRead, CacheStats, CommitOutcome, Lookup, MissReason, ReadState, RequestCache,
};
