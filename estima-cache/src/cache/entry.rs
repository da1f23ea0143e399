//! Cache entries and their deadlines.

use chrono::Duration;
use estima_core::{AnnotatedPricingResponse, StableKey, Timestamp};

/// A cached price with its freshness and eviction deadlines.
///
/// Invariant: `written_at <= fresh_until <= evict_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: StableKey,
    pub data: AnnotatedPricingResponse,
    pub written_at: Timestamp,
    pub fresh_until: Timestamp,
    pub evict_at: Timestamp,
    /// Sequence number of the write that produced this entry.
    pub seq: u64,
}

impl CacheEntry {
    pub fn new(
        key: StableKey,
        data: AnnotatedPricingResponse,
        now: Timestamp,
        stale_time: Duration,
        gc_time: Duration,
        seq: u64,
    ) -> Self {
        let fresh_until = now + stale_time;
        let evict_at = (now + gc_time).max(fresh_until);
        Self {
            key,
            data,
            written_at: now,
            fresh_until,
            evict_at,
            seq,
        }
    }

    pub fn is_fresh(&self, now: Timestamp) -> bool {
        now < self.fresh_until
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.evict_at
    }

    /// Extend the gc deadline after an access.
    pub fn touch(&mut self, now: Timestamp, gc_time: Duration) {
        self.evict_at = self.evict_at.max(now + gc_time).max(self.fresh_until);
    }

    /// Make the entry stale immediately without removing it.
    pub fn mark_stale(&mut self) {
        self.fresh_until = self.written_at;
    }

    pub fn age(&self, now: Timestamp) -> Duration {
        if now > self.written_at {
            now - self.written_at
        } else {
            Duration::zero()
        }
    }
}
