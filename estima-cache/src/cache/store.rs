//! Sharded request cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Duration;
use estima_core::{
    AnnotatedPricingResponse, CacheError, CatalogVersion, EngineConfig, InvalidationMode,
    Provenance, StableKey, TimeSource, Timestamp,
};

use super::entry::CacheEntry;
use super::freshness::{CacheRead, ReadState};
use super::stats::{CacheStats, Counters};

/// Windows longer than a century are clamped so deadline arithmetic cannot overflow.
const MAX_WINDOW_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

fn window(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_WINDOW_MS) as i64)
}

/// Why a lookup found nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    /// Never cached, or dropped so long ago that nothing is left.
    Cold,
    /// Dropped on this access because its gc deadline had passed.
    Expired,
    /// Removed by a catalog invalidation sweep.
    Invalidated,
}

impl MissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissReason::Cold => "cold",
            MissReason::Expired => "expired",
            MissReason::Invalidated => "invalidated",
        }
    }
}

/// Result of [`RequestCache::get`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheRead<AnnotatedPricingResponse>),
    Miss(MissReason),
}

impl Lookup {
    pub fn hit(self) -> Option<CacheRead<AnnotatedPricingResponse>> {
        match self {
            Lookup::Hit(read) => Some(read),
            Lookup::Miss(_) => None,
        }
    }
}

/// Result of a sequence-guarded commit.
///
/// `replaced_optimistic` is the total of the optimistic entry the commit
/// replaced, read under the same lock as the write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommitOutcome {
    Written { replaced_optimistic: Option<f64> },
    /// The value was priced under a catalog version other than the pinned
    /// one. It was kept as a placeholder (evict) or a stale entry
    /// (mark_stale) so the next read refetches.
    Outdated { replaced_optimistic: Option<f64> },
    /// A newer authoritative value was already present; nothing was written.
    DiscardedStale { current_seq: u64 },
}

impl CommitOutcome {
    pub fn replaced_optimistic(&self) -> Option<f64> {
        match self {
            CommitOutcome::Written { replaced_optimistic }
            | CommitOutcome::Outdated { replaced_optimistic } => *replaced_optimistic,
            CommitOutcome::DiscardedStale { .. } => None,
        }
    }
}

/// Catalog version commits are checked against after an invalidation.
#[derive(Debug, Clone)]
struct CatalogPin {
    version: CatalogVersion,
    mode: InvalidationMode,
}

/// Value left behind by an invalidation sweep.
#[derive(Debug, Clone)]
struct Retired {
    data: AnnotatedPricingResponse,
    written_at: Timestamp,
    evict_at: Timestamp,
    seq: u64,
}

#[derive(Debug, Default)]
struct Shard {
    live: HashMap<StableKey, CacheEntry>,
    retired: HashMap<StableKey, Retired>,
}

/// Key to annotated-price store with freshness and gc windows.
///
/// Each key lives in exactly one shard and every operation on a key holds
/// that shard's lock for its whole duration, so per-key reads and writes are
/// linearizable and no reader can observe a half-written entry. Sweeps lock
/// one shard at a time.
pub struct RequestCache {
    shards: Vec<RwLock<Shard>>,
    clock: Arc<dyn TimeSource>,
    stale_time: Duration,
    gc_time: Duration,
    sequence: AtomicU64,
    catalog: RwLock<Option<CatalogPin>>,
    counters: Counters,
}

impl std::fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCache")
            .field("shards", &self.shards.len())
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("sequence", &self.sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl RequestCache {
    /// Create a cache using the windows and shard count from `config`.
    pub fn new(config: &EngineConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self::with_windows(
            config.stale_time_ms,
            config.gc_time_ms,
            config.cache_shards,
            clock,
        )
    }

    pub fn with_windows(
        stale_time_ms: u64,
        gc_time_ms: u64,
        shards: usize,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let shards = (0..shards.max(1)).map(|_| RwLock::new(Shard::default())).collect();
        Self {
            shards,
            clock,
            stale_time: window(stale_time_ms),
            gc_time: window(gc_time_ms),
            sequence: AtomicU64::new(0),
            catalog: RwLock::new(None),
            counters: Counters::default(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn shard(&self, key: &StableKey) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Take the next write sequence number. Strictly increasing.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Read a key, counting a hit or miss.
    ///
    /// Expired entries are dropped on access. Placeholders are never
    /// returned here; a key that only has one reports `Invalidated`.
    pub fn get(&self, key: &StableKey) -> Result<Lookup, CacheError> {
        let now = self.now();
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;

        let mut expired = false;
        if let Some(entry) = shard.live.get_mut(key) {
            if entry.is_expired(now) {
                expired = true;
            } else {
                entry.touch(now, self.gc_time);
                let state = if entry.is_fresh(now) {
                    ReadState::Fresh
                } else {
                    Counters::bump(&self.counters.stale_hits, 1);
                    ReadState::Stale
                };
                Counters::bump(&self.counters.hits, 1);
                return Ok(Lookup::Hit(CacheRead::new(
                    entry.data.clone(),
                    entry.written_at,
                    now,
                    state,
                    entry.seq,
                )));
            }
        }

        Counters::bump(&self.counters.misses, 1);

        if expired {
            shard.live.remove(key);
            Counters::bump(&self.counters.evictions, 1);
            return Ok(Lookup::Miss(MissReason::Expired));
        }

        let placeholder_alive = shard.retired.get(key).map(|retired| now < retired.evict_at);
        match placeholder_alive {
            Some(true) => Ok(Lookup::Miss(MissReason::Invalidated)),
            Some(false) => {
                shard.retired.remove(key);
                Ok(Lookup::Miss(MissReason::Cold))
            }
            None => Ok(Lookup::Miss(MissReason::Cold)),
        }
    }

    /// Copy of the live entry for `key` without touching it or the counters.
    pub fn peek(&self, key: &StableKey) -> Option<CacheEntry> {
        let now = self.now();
        let shard = self.shard(key).read().ok()?;
        shard
            .live
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Last known value for `key`, falling back to an invalidated placeholder.
    ///
    /// Does not count toward hit/miss statistics.
    pub fn read_with_placeholder(&self, key: &StableKey) -> Option<CacheRead<AnnotatedPricingResponse>> {
        let now = self.now();
        let mut shard = self.shard(key).write().ok()?;

        if let Some(entry) = shard.live.get_mut(key) {
            if !entry.is_expired(now) {
                entry.touch(now, self.gc_time);
                let state = if entry.is_fresh(now) {
                    ReadState::Fresh
                } else {
                    ReadState::Stale
                };
                return Some(CacheRead::new(
                    entry.data.clone(),
                    entry.written_at,
                    now,
                    state,
                    entry.seq,
                ));
            }
        }

        shard
            .retired
            .get(key)
            .filter(|retired| now < retired.evict_at)
            .map(|retired| {
                CacheRead::placeholder(retired.data.clone(), retired.written_at, now, retired.seq)
            })
    }

    /// Unconditionally write `data` under a fresh sequence number.
    ///
    /// Returns the sequence number of the write.
    pub fn set(&self, key: &StableKey, data: AnnotatedPricingResponse) -> Result<u64, CacheError> {
        let seq = self.next_sequence();
        let now = self.now();
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        shard.retired.remove(key);
        shard.live.insert(
            key.clone(),
            CacheEntry::new(key.clone(), data, now, self.stale_time, self.gc_time, seq),
        );
        Ok(seq)
    }

    /// Write `data` unless a newer authoritative value is already cached.
    ///
    /// `seq` must have been taken with [`next_sequence`](Self::next_sequence)
    /// before the fetch that produced `data` started. If the live entry is a
    /// server price written under a larger sequence, the commit is discarded.
    /// A value whose catalog version differs from the pinned one is stored
    /// the way an invalidation sweep would have left it.
    pub fn commit(
        &self,
        key: &StableKey,
        data: AnnotatedPricingResponse,
        seq: u64,
    ) -> Result<CommitOutcome, CacheError> {
        let now = self.now();
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        // read under the shard lock so a concurrent pin-then-sweep cannot miss this write
        let pin = self.pinned_catalog()?;

        let mut replaced_optimistic = None;
        if let Some(existing) = shard.live.get(key) {
            if !existing.is_expired(now) {
                if existing.data.provenance == Provenance::Server && existing.seq > seq {
                    return Ok(CommitOutcome::DiscardedStale {
                        current_seq: existing.seq,
                    });
                }
                if existing.data.is_optimistic() {
                    replaced_optimistic = Some(existing.data.total_price());
                }
            }
        }

        let outdated = pin
            .as_ref()
            .filter(|pin| *data.catalog_version() != pin.version)
            .map(|pin| pin.mode);

        shard.retired.remove(key);
        let mut entry = CacheEntry::new(key.clone(), data, now, self.stale_time, self.gc_time, seq);
        match outdated {
            None => {
                shard.live.insert(key.clone(), entry);
                Ok(CommitOutcome::Written { replaced_optimistic })
            }
            Some(InvalidationMode::Evict) => {
                shard.live.remove(key);
                shard.retired.insert(
                    key.clone(),
                    Retired {
                        data: entry.data,
                        written_at: entry.written_at,
                        evict_at: entry.evict_at,
                        seq: entry.seq,
                    },
                );
                Counters::bump(&self.counters.invalidations, 1);
                Ok(CommitOutcome::Outdated { replaced_optimistic })
            }
            Some(InvalidationMode::MarkStale) => {
                entry.mark_stale();
                shard.live.insert(key.clone(), entry);
                Counters::bump(&self.counters.invalidations, 1);
                Ok(CommitOutcome::Outdated { replaced_optimistic })
            }
        }
    }

    /// Record `version` as current. Later commits priced under any other
    /// version are stored as already invalidated under `mode`.
    pub fn pin_catalog_version(
        &self,
        version: CatalogVersion,
        mode: InvalidationMode,
    ) -> Result<(), CacheError> {
        let mut pin = self.catalog.write().map_err(|_| CacheError::LockPoisoned)?;
        *pin = Some(CatalogPin { version, mode });
        Ok(())
    }

    pub fn pinned_catalog_version(&self) -> Option<CatalogVersion> {
        self.pinned_catalog().ok()?.map(|pin| pin.version)
    }

    fn pinned_catalog(&self) -> Result<Option<CatalogPin>, CacheError> {
        Ok(self
            .catalog
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .clone())
    }

    pub fn remove(&self, key: &StableKey) -> Result<Option<CacheEntry>, CacheError> {
        let mut shard = self
            .shard(key)
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        shard.retired.remove(key);
        Ok(shard.live.remove(key))
    }

    /// Evict or mark stale every live entry matching `predicate`.
    ///
    /// Locks one shard at a time. Evicted values are kept as placeholders
    /// until their gc deadline. Returns the number of entries affected.
    pub fn invalidate_where<F>(&self, predicate: F, mode: InvalidationMode) -> Result<usize, CacheError>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut affected = 0;

        for lock in &self.shards {
            let mut shard = lock.write().map_err(|_| CacheError::LockPoisoned)?;
            let matching: Vec<StableKey> = shard
                .live
                .values()
                .filter(|&entry| predicate(entry))
                .map(|entry| entry.key.clone())
                .collect();

            for key in matching {
                match mode {
                    InvalidationMode::Evict => {
                        if let Some(entry) = shard.live.remove(&key) {
                            shard.retired.insert(
                                key,
                                Retired {
                                    data: entry.data,
                                    written_at: entry.written_at,
                                    evict_at: entry.evict_at,
                                    seq: entry.seq,
                                },
                            );
                            affected += 1;
                        }
                    }
                    InvalidationMode::MarkStale => {
                        if let Some(entry) = shard.live.get_mut(&key) {
                            entry.mark_stale();
                            affected += 1;
                        }
                    }
                }
            }
        }

        Counters::bump(&self.counters.invalidations, affected as u64);
        Ok(affected)
    }

    /// Drop every entry and placeholder past its gc deadline.
    ///
    /// Returns the number of live entries dropped.
    pub fn sweep_expired(&self) -> Result<usize, CacheError> {
        let now = self.now();
        let mut removed = 0;

        for lock in &self.shards {
            let mut shard = lock.write().map_err(|_| CacheError::LockPoisoned)?;
            let before = shard.live.len();
            shard.live.retain(|_, entry| !entry.is_expired(now));
            removed += before - shard.live.len();
            shard.retired.retain(|_, retired| now < retired.evict_at);
        }

        if removed > 0 {
            Counters::bump(&self.counters.evictions, removed as u64);
            tracing::debug!(removed, "gc sweep dropped expired entries");
        }
        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` on the
    /// current tokio runtime.
    ///
    /// The task holds only a weak reference and ends once the cache is dropped.
    pub fn spawn_gc(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = cache.sweep_expired() {
                    tracing::warn!(error = %e, "gc sweep failed");
                }
            }
        })
    }

    /// Number of live entries (placeholders excluded).
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|lock| lock.read().map(|shard| shard.live.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.len() as u64)
    }

    /// Drop every entry and placeholder. Counters are kept.
    pub fn clear(&self) -> Result<(), CacheError> {
        for lock in &self.shards {
            let mut shard = lock.write().map_err(|_| CacheError::LockPoisoned)?;
            shard.live.clear();
            shard.retired.clear();
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
