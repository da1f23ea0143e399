//! Structured telemetry.
//!
//! The engine reports what it does as [`TelemetryEvent`]s delivered to a
//! [`TelemetrySink`]. Delivery is fire-and-forget: sinks must return quickly
//! and must never fail the caller.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Duration;
use estima_cache::MissReason;
use estima_core::{StableKey, SystemTimeSource, TimeSource, Timestamp};
use tokio::sync::mpsc;

// ============================================================================
// EVENTS
// ============================================================================

/// Where a cache hit was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// A fresh authoritative entry in the local cache; no fetch happened.
    Memory,
    /// The pricing service answered from its own cache.
    Network,
}

impl fmt::Display for HitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HitSource::Memory => f.write_str("memory"),
            HitSource::Network => f.write_str("network"),
        }
    }
}

/// Something the engine did.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    CacheHit {
        at: Timestamp,
        key: StableKey,
        elapsed_ms: u64,
        source: HitSource,
    },
    CacheMiss {
        at: Timestamp,
        key: StableKey,
        elapsed_ms: u64,
        reason: MissReason,
    },
    OptimisticApply {
        at: Timestamp,
        key: StableKey,
        confidence: f64,
        baseline_total: f64,
        estimated_total: f64,
        delta: f64,
    },
    OptimisticRollback {
        at: Timestamp,
        key: StableKey,
        optimistic_total: f64,
        server_total: f64,
        deviation: f64,
    },
    Error {
        at: Timestamp,
        key: StableKey,
        error: String,
        retry_count: u32,
    },
    /// Named gauge, e.g. `invalidation.evicted`.
    Metric {
        at: Timestamp,
        name: String,
        value: f64,
    },
}

impl TelemetryEvent {
    pub fn at(&self) -> Timestamp {
        match self {
            TelemetryEvent::CacheHit { at, .. }
            | TelemetryEvent::CacheMiss { at, .. }
            | TelemetryEvent::OptimisticApply { at, .. }
            | TelemetryEvent::OptimisticRollback { at, .. }
            | TelemetryEvent::Error { at, .. }
            | TelemetryEvent::Metric { at, .. } => *at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::CacheHit { .. } => "price_cache_hit",
            TelemetryEvent::CacheMiss { .. } => "price_cache_miss",
            TelemetryEvent::OptimisticApply { .. } => "optimistic_update_applied",
            TelemetryEvent::OptimisticRollback { .. } => "optimistic_update_rollback",
            TelemetryEvent::Error { .. } => "pricing_error",
            TelemetryEvent::Metric { .. } => "metric",
        }
    }

    pub fn key(&self) -> Option<&StableKey> {
        match self {
            TelemetryEvent::CacheHit { key, .. }
            | TelemetryEvent::CacheMiss { key, .. }
            | TelemetryEvent::OptimisticApply { key, .. }
            | TelemetryEvent::OptimisticRollback { key, .. }
            | TelemetryEvent::Error { key, .. } => Some(key),
            TelemetryEvent::Metric { .. } => None,
        }
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Receiver of telemetry events. Must not block.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Renders events as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::CacheHit {
                key,
                elapsed_ms,
                source,
                ..
            } => {
                tracing::debug!(key = %key.short(), elapsed_ms, source = %source, "price cache hit");
            }
            TelemetryEvent::CacheMiss {
                key,
                elapsed_ms,
                reason,
                ..
            } => {
                tracing::info!(
                    key = %key.short(),
                    elapsed_ms,
                    reason = reason.as_str(),
                    "price cache miss"
                );
            }
            TelemetryEvent::OptimisticApply {
                key,
                confidence,
                baseline_total,
                estimated_total,
                delta,
                ..
            } => {
                tracing::debug!(
                    key = %key.short(),
                    confidence,
                    baseline_total,
                    estimated_total,
                    delta,
                    "optimistic price applied"
                );
            }
            TelemetryEvent::OptimisticRollback {
                key,
                optimistic_total,
                server_total,
                deviation,
                ..
            } => {
                tracing::warn!(
                    key = %key.short(),
                    optimistic_total,
                    server_total,
                    deviation,
                    "optimistic price rolled back"
                );
            }
            TelemetryEvent::Error {
                key,
                error,
                retry_count,
                ..
            } => {
                tracing::error!(key = %key.short(), retry_count, error = %error, "pricing failed");
            }
            TelemetryEvent::Metric { name, value, .. } => {
                tracing::info!(metric = %name, value, "metric");
            }
        }
    }
}

/// Keeps the most recent events in a bounded ring buffer.
pub struct RecordingSink {
    events: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    clock: Arc<dyn TimeSource>,
}

impl fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSink")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl RecordingSink {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemTimeSource))
    }

    /// Use `clock` to resolve the windows of the rate queries.
    pub fn with_clock(capacity: usize, clock: Arc<dyn TimeSource>) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(4_096))),
            capacity,
            clock,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All buffered events, oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The `n` most recent events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .map(|e| e.iter().skip(e.len().saturating_sub(n)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .map(|e| e.iter().filter(|ev| ev.kind() == kind).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn within(&self, window: Option<Duration>) -> Vec<TelemetryEvent> {
        let cutoff = window.map(|w| self.clock.now() - w);
        self.events
            .lock()
            .map(|e| {
                e.iter()
                    .filter(|ev| cutoff.map_or(true, |c| ev.at() >= c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Hits / (hits + misses) over the window, or all buffered events.
    pub fn cache_hit_rate(&self, window: Option<Duration>) -> f64 {
        let events = self.within(window);
        let hits = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::CacheHit { .. }))
            .count();
        let misses = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::CacheMiss { .. }))
            .count();
        ratio(hits, hits + misses)
    }

    /// Rollbacks / optimistic applies over the window.
    pub fn rollback_rate(&self, window: Option<Duration>) -> f64 {
        let events = self.within(window);
        let applies = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::OptimisticApply { .. }))
            .count();
        let rollbacks = events
            .iter()
            .filter(|e| matches!(e, TelemetryEvent::OptimisticRollback { .. }))
            .count();
        ratio(rollbacks, applies)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

impl TelemetrySink for RecordingSink {
    fn record(&self, event: TelemetryEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

/// Forwards events over a bounded channel. Drops events when it is full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events lost because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelSink {
    fn record(&self, event: TelemetryEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Delivers every event to each of several sinks, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add(&mut self, sink: Arc<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl TelemetrySink for FanoutSink {
    fn record(&self, event: TelemetryEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
