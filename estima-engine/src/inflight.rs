//! Single-flight deduplication.
//!
//! At most one future runs per key. Callers arriving while it is pending are
//! attached to the same shared result instead of starting another one. The
//! registry entry is removed by the flight itself when it completes, so the
//! next call after completion starts fresh.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use estima_core::{CacheError, EstimaResult};
use futures_util::future::{BoxFuture, FutureExt, Shared};

type SharedFlight<T> = Shared<BoxFuture<'static, EstimaResult<T>>>;

struct Flight<T> {
    id: u64,
    future: SharedFlight<T>,
}

/// Result of [`InFlightRegistry::run_exclusive`].
#[derive(Debug, Clone, PartialEq)]
pub struct Joined<T> {
    pub result: EstimaResult<T>,
    /// True when this call attached to a flight started by another caller.
    pub coalesced: bool,
}

/// Registry of pending flights keyed by `K`.
pub struct InFlightRegistry<K, T> {
    flights: Arc<Mutex<HashMap<K, Flight<T>>>>,
    next_id: AtomicU64,
    started: AtomicU64,
    coalesced: AtomicU64,
}

impl<K, T> Default for InFlightRegistry<K, T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            started: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }
}

impl<K, T> std::fmt::Debug for InFlightRegistry<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("coalesced", &self.coalesced.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, T> InFlightRegistry<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key` unless a flight for `key` is already pending, in
    /// which case wait for that flight's result instead.
    ///
    /// `f` is only called when a new flight starts. Failures are shared with
    /// every attached caller and never retried here.
    pub async fn run_exclusive<F, Fut>(&self, key: K, f: F) -> Joined<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EstimaResult<T>> + Send + 'static,
    {
        let (future, coalesced) = {
            let mut flights = match self.flights.lock() {
                Ok(flights) => flights,
                Err(_) => {
                    return Joined {
                        result: Err(CacheError::LockPoisoned.into()),
                        coalesced: false,
                    }
                }
            };

            if let Some(flight) = flights.get(&key) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                (flight.future.clone(), true)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.flights);
                let own_key = key.clone();
                let work = f();
                let future = async move {
                    let result = work.await;
                    if let Ok(mut flights) = registry.lock() {
                        if flights.get(&own_key).map(|flight| flight.id) == Some(id) {
                            flights.remove(&own_key);
                        }
                    }
                    result
                }
                .boxed()
                .shared();

                flights.insert(
                    key,
                    Flight {
                        id,
                        future: future.clone(),
                    },
                );
                self.started.fetch_add(1, Ordering::Relaxed);
                (future, false)
            }
        };

        Joined {
            result: future.await,
            coalesced,
        }
    }

    /// Number of flights currently pending.
    pub fn len(&self) -> usize {
        self.flights.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.flights
            .lock()
            .map(|f| f.contains_key(key))
            .unwrap_or(false)
    }

    /// Flights started since creation.
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    /// Calls that attached to an existing flight since creation.
    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

// ============================================================================
// TESTS
// ============================================================================
