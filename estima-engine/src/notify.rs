//! Caller-facing notifications (toasts, status lines).
//!
//! None of these affect correctness. A rollback is reported only when the
//! reconciled request is still what the caller is looking at.

use estima_core::{EstimaError, StableKey};
use std::time::Duration;

/// An optimistic price replaced by a sufficiently different server price.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackNotice {
    pub key: StableKey,
    pub optimistic_total: f64,
    pub server_total: f64,
    pub deviation: f64,
}

/// Hooks for user-visible pricing notifications. All methods default to no-ops.
pub trait PriceNotifier: Send + Sync {
    fn on_rollback(&self, _notice: &RollbackNotice) {}

    /// A fetch is still running after the slow-fetch threshold.
    fn on_slow_fetch(&self, _key: &StableKey, _elapsed: Duration) {}

    /// Reconciliation failed after exhausting retries.
    fn on_failure(&self, _key: &StableKey, _error: &EstimaError) {}
}

/// Ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl PriceNotifier for NoopNotifier {}
