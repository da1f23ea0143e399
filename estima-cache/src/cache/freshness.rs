//! Freshness metadata attached to cache reads.
//!
//! A read never hands out a bare value: callers get a [`CacheRead<T>`] that
//! says whether the value is still inside its freshness window, how old it
//! is, and whether it is only a placeholder left behind by an invalidation.

use chrono::Duration;
use estima_core::Timestamp;

/// Freshness of a value at the moment it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Inside the freshness window; no refetch needed.
    Fresh,
    /// Past the freshness window; served immediately but due for refresh.
    Stale,
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: T,
    written_at: Timestamp,
    read_at: Timestamp,
    state: ReadState,
    seq: u64,
    placeholder: bool,
}

impl<T> CacheRead<T> {
    pub fn new(
        value: T,
        written_at: Timestamp,
        read_at: Timestamp,
        state: ReadState,
        seq: u64,
    ) -> Self {
        Self {
            value,
            written_at,
            read_at,
            state,
            seq,
            placeholder: false,
        }
    }

    /// A value retained after its entry was invalidated. Always stale.
    pub fn placeholder(value: T, written_at: Timestamp, read_at: Timestamp, seq: u64) -> Self {
        Self {
            value,
            written_at,
            read_at,
            state: ReadState::Stale,
            seq,
            placeholder: true,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn is_fresh(&self) -> bool {
        self.state == ReadState::Fresh
    }

    pub fn is_stale(&self) -> bool {
        self.state == ReadState::Stale
    }

    /// True when the caller should trigger a background reconciliation.
    pub fn needs_refresh(&self) -> bool {
        self.is_stale()
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    pub fn written_at(&self) -> Timestamp {
        self.written_at
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Age of the value when it was read.
    pub fn staleness(&self) -> Duration {
        if self.read_at > self.written_at {
            self.read_at - self.written_at
        } else {
            Duration::zero()
        }
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            written_at: self.written_at,
            read_at: self.read_at,
            state: self.state,
            seq: self.seq,
            placeholder: self.placeholder,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
