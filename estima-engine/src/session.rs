//! Per-view pricing state.
//!
//! A session remembers the request its view is currently showing. That
//! request is the baseline for the next optimistic estimate, and it is the
//! intent a finished reconciliation is checked against: a result for a
//! request the view has already moved away from is kept in the cache under
//! its own key but never displayed or announced.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use estima_cache::CacheRead;
use estima_core::{
    build_key, AnnotatedPricingResponse, CacheError, EstimaError, EstimaResult, PricingRequest,
    StableKey,
};

use crate::notify::{PriceNotifier, RollbackNotice};
use crate::reconcile::{ReconcileOutcome, Reconciler};

#[derive(Debug, Default)]
struct SessionState {
    current_key: Option<StableKey>,
    current_request: Option<PricingRequest>,
    /// Last price shown for any key in this session.
    displayed: Option<AnnotatedPricingResponse>,
    /// Flight whose rollback this session last announced.
    announced_flight: Option<u64>,
}

/// The engine's notifier, as seen by the fetch layer and by sessions.
///
/// Rollback and failure notices are already filtered by the session that
/// raises them and pass straight through. Slow-fetch warnings come from a
/// shared flight with no caller attached, so they are forwarded only while
/// some live session is showing the slow key.
pub(crate) struct SessionDirectory {
    notifier: Arc<dyn PriceNotifier>,
    sessions: Mutex<Vec<Weak<Mutex<SessionState>>>>,
}

impl SessionDirectory {
    pub(crate) fn new(notifier: Arc<dyn PriceNotifier>) -> Self {
        Self {
            notifier,
            sessions: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, state: &Arc<Mutex<SessionState>>) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.retain(|weak| weak.strong_count() > 0);
            sessions.push(Arc::downgrade(state));
        }
    }

    fn is_showing(&self, key: &StableKey) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.iter().filter_map(Weak::upgrade).any(|state| {
            state
                .lock()
                .map(|state| state.current_key.as_ref() == Some(key))
                .unwrap_or(false)
        })
    }
}

impl PriceNotifier for SessionDirectory {
    fn on_rollback(&self, notice: &RollbackNotice) {
        self.notifier.on_rollback(notice);
    }

    fn on_slow_fetch(&self, key: &StableKey, elapsed: Duration) {
        if self.is_showing(key) {
            self.notifier.on_slow_fetch(key, elapsed);
        } else {
            tracing::debug!(key = %key.short(), "slow fetch for a key no session is showing");
        }
    }

    fn on_failure(&self, key: &StableKey, error: &EstimaError) {
        self.notifier.on_failure(key, error);
    }
}

/// Pricing state for one view.
pub struct PriceSession {
    reconciler: Reconciler,
    notifier: Arc<SessionDirectory>,
    state: Arc<Mutex<SessionState>>,
}

impl std::fmt::Debug for PriceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceSession")
            .field("current_key", &self.current_key())
            .finish()
    }
}

impl PriceSession {
    pub(crate) fn new(reconciler: Reconciler, notifier: Arc<SessionDirectory>) -> Self {
        let state = Arc::new(Mutex::new(SessionState::default()));
        notifier.register(&state);
        Self {
            reconciler,
            notifier,
            state,
        }
    }

    pub fn current_key(&self) -> Option<StableKey> {
        self.state.lock().ok()?.current_key.clone()
    }

    pub fn current_request(&self) -> Option<PricingRequest> {
        self.state.lock().ok()?.current_request.clone()
    }

    /// The price to show right now.
    ///
    /// Reads the current key with placeholder semantics; while that key has
    /// no value yet, the previously displayed price is returned instead.
    pub fn current_price(&self) -> Option<AnnotatedPricingResponse> {
        let (key, displayed) = {
            let state = self.state.lock().ok()?;
            (state.current_key.clone(), state.displayed.clone())
        };
        key.and_then(|key| {
            self.reconciler
                .cache()
                .read_with_placeholder(&key)
                .map(CacheRead::into_value)
        })
        .or(displayed)
    }

    /// Make `request` the current intent, show an optimistic estimate when
    /// one is possible, then reconcile with the pricing function.
    pub async fn update_price(&self, request: &PricingRequest) -> EstimaResult<ReconcileOutcome> {
        let key = build_key(request)?;

        let baseline = {
            let mut state = self.state.lock().map_err(|_| CacheError::LockPoisoned)?;
            state.current_request = Some(request.clone());
            state.current_key.replace(key.clone())
        };

        if let Some(applied) = self.reconciler.apply_optimistic(baseline.as_ref(), request)? {
            self.settle(&key, applied, None);
        }

        match self.reconciler.reconcile(request).await {
            Ok(mut outcome) => {
                let shown = AnnotatedPricingResponse::server(outcome.response.clone(), request.clone());
                let rollback_flight = outcome.flight_seq.filter(|_| outcome.rolled_back);
                let settled = self.settle(&key, shown, rollback_flight);
                outcome.superseded = settled.is_none();

                if outcome.superseded {
                    tracing::debug!(key = %key.short(), "result for superseded request kept in cache only");
                } else if settled == Some(true) {
                    if let (Some(optimistic_total), Some(deviation)) =
                        (outcome.optimistic_total, outcome.deviation)
                    {
                        self.notifier.on_rollback(&RollbackNotice {
                            key: key.clone(),
                            optimistic_total,
                            server_total: outcome.response.total_price,
                            deviation,
                        });
                    }
                }
                Ok(outcome)
            }
            Err(error) => {
                if self.is_current(&key) {
                    self.notifier.on_failure(&key, &error);
                }
                Err(error)
            }
        }
    }

    /// Warm the cache for `request` without touching this session's state.
    pub async fn prefetch(&self, request: &PricingRequest) -> EstimaResult<ReconcileOutcome> {
        self.reconciler.reconcile(request).await
    }

    fn is_current(&self, key: &StableKey) -> bool {
        self.state
            .lock()
            .map(|state| state.current_key.as_ref() == Some(key))
            .unwrap_or(false)
    }

    /// Show `price` if `key` is still current.
    ///
    /// Returns `None` when the session has moved on. Otherwise returns
    /// whether the rollback of `rollback_flight` still has to be announced;
    /// each flight is announced at most once per session, however many of
    /// this session's calls were attached to it.
    fn settle(
        &self,
        key: &StableKey,
        price: AnnotatedPricingResponse,
        rollback_flight: Option<u64>,
    ) -> Option<bool> {
        let mut state = self.state.lock().ok()?;
        if state.current_key.as_ref() != Some(key) {
            return None;
        }
        state.displayed = Some(price);
        let announce = match rollback_flight {
            Some(seq) if state.announced_flight != Some(seq) => {
                state.announced_flight = Some(seq);
                true
            }
            _ => false,
        };
        Some(announce)
    }
}
