//! Optimistic apply, authoritative fetch, compare, commit or roll back.
//!
//! ```text
//! update_price(next)
//!   ├─ apply_optimistic: baseline entry ─► estimate ─► optimistic entry for key(next)
//!   └─ reconcile: fresh server entry? ─► done
//!                 single-flight(key) ─► fetch ─► compare with optimistic ─► commit
//! ```
//!
//! Each fetch result is written only to the entry of its own key. Commits are
//! sequence-guarded so a result older than the authoritative value already in
//! place is discarded instead of clobbering it. The optimistic total that a
//! commit is compared against is the one it replaced, read under the same
//! shard lock as the write.

use std::sync::Arc;

use estima_cache::{CacheRead, CommitOutcome, Lookup, MissReason, RequestCache};
use estima_core::{
    build_key, AnnotatedPricingResponse, EngineConfig, EstimaResult, PricingRequest,
    PricingResponse, StableKey,
};
use tokio::time::Instant;

use crate::estimate::EstimateEngine;
use crate::fetch::Fetcher;
use crate::inflight::InFlightRegistry;
use crate::notify::PriceNotifier;
use crate::provider::PricingFunction;
use crate::telemetry::{HitSource, TelemetryEvent, TelemetrySink};

/// Relative deviation of an optimistic total from the server total.
///
/// The server total is always the denominator. A zero server total yields
/// infinity so that a zero authoritative price always replaces the estimate.
pub fn deviation(server_total: f64, optimistic_total: f64) -> f64 {
    if server_total == 0.0 {
        f64::INFINITY
    } else {
        (server_total - optimistic_total).abs() / server_total.abs()
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// The authoritative price for `key`.
    pub response: PricingResponse,
    pub key: StableKey,
    /// An optimistic price was replaced because it deviated too far.
    pub rolled_back: bool,
    /// Deviation of the replaced optimistic price, if there was one.
    pub deviation: Option<f64>,
    pub optimistic_total: Option<f64>,
    /// The caller moved on to another request while this one was in flight.
    pub superseded: bool,
    /// The fetched value lost against a newer authoritative value.
    pub discarded_stale: bool,
    /// Priced under a catalog version that has since been replaced; cached
    /// as already invalidated.
    pub outdated_catalog: bool,
    /// Attached to a fetch started by another caller.
    pub coalesced: bool,
    /// Answered from a fresh cache entry without fetching.
    pub from_memory: bool,
    /// Sequence number of the flight that produced this outcome. Every
    /// caller attached to one flight sees the same value.
    pub flight_seq: Option<u64>,
}

/// Shared result of one flight.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightResult {
    response: PricingResponse,
    rolled_back: bool,
    deviation: Option<f64>,
    optimistic_total: Option<f64>,
    discarded_stale: bool,
    outdated_catalog: bool,
    seq: u64,
}

/// Orchestrates optimistic apply and reconciliation against one cache.
#[derive(Clone)]
pub struct Reconciler {
    cache: Arc<RequestCache>,
    inflight: Arc<InFlightRegistry<StableKey, FlightResult>>,
    estimator: EstimateEngine,
    fetcher: Fetcher,
    telemetry: Arc<dyn TelemetrySink>,
    rollback_threshold: f64,
}

impl Reconciler {
    pub fn new(
        cache: Arc<RequestCache>,
        pricing: Arc<dyn PricingFunction>,
        telemetry: Arc<dyn TelemetrySink>,
        notifier: Arc<dyn PriceNotifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache,
            inflight: Arc::new(InFlightRegistry::new()),
            estimator: EstimateEngine::new(config.estimate.clone()),
            fetcher: Fetcher::new(pricing, notifier, config),
            telemetry,
            rollback_threshold: config.rollback_threshold,
        }
    }

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.cache
    }

    pub fn inflight(&self) -> &InFlightRegistry<StableKey, FlightResult> {
        &self.inflight
    }

    pub fn rollback_threshold(&self) -> f64 {
        self.rollback_threshold
    }

    fn emit(&self, event: TelemetryEvent) {
        self.telemetry.record(event);
    }

    /// Write an optimistic entry for `next`, extrapolated from the entry of
    /// `baseline_key`.
    ///
    /// Does nothing when there is no baseline, when the estimate is withheld,
    /// or when `next` already has an authoritative entry.
    pub fn apply_optimistic(
        &self,
        baseline_key: Option<&StableKey>,
        next: &PricingRequest,
    ) -> EstimaResult<Option<AnnotatedPricingResponse>> {
        let key = build_key(next)?;

        if self
            .cache
            .peek(&key)
            .is_some_and(|entry| !entry.data.is_optimistic())
        {
            return Ok(None);
        }

        let Some(baseline_key) = baseline_key.filter(|baseline| **baseline != key) else {
            return Ok(None);
        };
        let Some(baseline) = self
            .cache
            .read_with_placeholder(baseline_key)
            .map(CacheRead::into_value)
        else {
            return Ok(None);
        };

        let Some(estimate) = self.estimator.estimate(Some(&baseline), next) else {
            tracing::debug!(key = %key.short(), "no optimistic estimate");
            return Ok(None);
        };

        let baseline_total = baseline.total_price();
        let estimated_total = estimate.response.total_price;
        let confidence = estimate.confidence;
        let annotated =
            AnnotatedPricingResponse::optimistic(estimate.response, next.clone(), confidence);
        self.cache.set(&key, annotated.clone())?;

        tracing::debug!(
            key = %key.short(),
            baseline_total,
            estimated_total,
            confidence,
            "optimistic price written"
        );
        self.emit(TelemetryEvent::OptimisticApply {
            at: self.cache.now(),
            key,
            confidence,
            baseline_total,
            estimated_total,
            delta: estimated_total - baseline_total,
        });

        Ok(Some(annotated))
    }

    /// Bring the entry for `request` up to date with the pricing function.
    ///
    /// A fresh authoritative entry is returned without fetching. Otherwise
    /// the fetch runs at most once per key at a time; concurrent callers for
    /// the same key share its result, including its failure.
    pub async fn reconcile(&self, request: &PricingRequest) -> EstimaResult<ReconcileOutcome> {
        let started = Instant::now();
        let key = build_key(request)?;

        let reason = match self.cache.get(&key)? {
            Lookup::Hit(read) if read.is_fresh() && !read.value().is_optimistic() => {
                self.emit(TelemetryEvent::CacheHit {
                    at: self.cache.now(),
                    key: key.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    source: HitSource::Memory,
                });
                return Ok(ReconcileOutcome {
                    response: read.into_value().response,
                    key,
                    rolled_back: false,
                    deviation: None,
                    optimistic_total: None,
                    superseded: false,
                    discarded_stale: false,
                    outdated_catalog: false,
                    coalesced: false,
                    from_memory: true,
                    flight_seq: None,
                });
            }
            Lookup::Hit(read) if read.value().is_optimistic() => MissReason::Cold,
            Lookup::Hit(_) => MissReason::Expired,
            Lookup::Miss(reason) => reason,
        };

        let this = self.clone();
        let flight_key = key.clone();
        let flight_request = request.clone();
        let joined = self
            .inflight
            .run_exclusive(key.clone(), move || async move {
                this.run_flight(flight_key, flight_request, reason, started)
                    .await
            })
            .await;

        if joined.coalesced {
            tracing::debug!(key = %key.short(), "attached to in-flight fetch");
        }

        let flight = joined.result?;
        Ok(ReconcileOutcome {
            response: flight.response,
            key,
            rolled_back: flight.rolled_back,
            deviation: flight.deviation,
            optimistic_total: flight.optimistic_total,
            superseded: false,
            discarded_stale: flight.discarded_stale,
            outdated_catalog: flight.outdated_catalog,
            coalesced: joined.coalesced,
            from_memory: false,
            flight_seq: Some(flight.seq),
        })
    }

    /// `apply_optimistic` followed by `reconcile`.
    pub async fn update_price(
        &self,
        baseline_key: Option<&StableKey>,
        request: &PricingRequest,
    ) -> EstimaResult<ReconcileOutcome> {
        self.apply_optimistic(baseline_key, request)?;
        self.reconcile(request).await
    }

    async fn run_flight(
        self,
        key: StableKey,
        request: PricingRequest,
        reason: MissReason,
        started: Instant,
    ) -> EstimaResult<FlightResult> {
        let seq = self.cache.next_sequence();

        let fetched = match self.fetcher.fetch(&key, &request).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                self.emit(TelemetryEvent::Error {
                    at: self.cache.now(),
                    key,
                    error: failure.error.to_string(),
                    retry_count: failure.retries,
                });
                return Err(failure.error);
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if fetched.response.from_cache {
            self.emit(TelemetryEvent::CacheHit {
                at: self.cache.now(),
                key: key.clone(),
                elapsed_ms,
                source: HitSource::Network,
            });
        } else {
            self.emit(TelemetryEvent::CacheMiss {
                at: self.cache.now(),
                key: key.clone(),
                elapsed_ms,
                reason,
            });
        }

        let server_total = fetched.response.total_price;
        let annotated = AnnotatedPricingResponse::server(fetched.response.clone(), request);
        let outcome = self.cache.commit(&key, annotated, seq)?;

        if let CommitOutcome::DiscardedStale { current_seq } = outcome {
            tracing::debug!(
                key = %key.short(),
                seq,
                current_seq,
                "discarded result older than cached value"
            );
            let response = self
                .cache
                .peek(&key)
                .map(|entry| entry.data.response)
                .unwrap_or(fetched.response);
            return Ok(FlightResult {
                response,
                rolled_back: false,
                deviation: None,
                optimistic_total: None,
                discarded_stale: true,
                outdated_catalog: false,
                seq,
            });
        }

        let outdated_catalog = matches!(outcome, CommitOutcome::Outdated { .. });
        if outdated_catalog {
            tracing::debug!(
                key = %key.short(),
                catalog_version = %fetched.response.catalog_version,
                "result priced under a replaced catalog version"
            );
        }

        let optimistic_total = outcome.replaced_optimistic();
        let deviation = optimistic_total.map(|optimistic| deviation(server_total, optimistic));
        let exceeds = deviation.is_some_and(|d| d > self.rollback_threshold);

        if let (true, Some(optimistic_total), Some(deviation)) =
            (exceeds, optimistic_total, deviation)
        {
            tracing::info!(
                key = %key.short(),
                optimistic_total,
                server_total,
                deviation,
                "optimistic price replaced"
            );
            self.emit(TelemetryEvent::OptimisticRollback {
                at: self.cache.now(),
                key,
                optimistic_total,
                server_total,
                deviation,
            });
        } else if let Some(deviation) = deviation {
            tracing::debug!(
                key = %key.short(),
                deviation,
                "optimistic price confirmed"
            );
        }

        Ok(FlightResult {
            response: fetched.response,
            rolled_back: exceeds,
            deviation,
            optimistic_total,
            discarded_stale: false,
            outdated_catalog,
            seq,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
