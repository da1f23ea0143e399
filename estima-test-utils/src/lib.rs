//! estima Test Utilities
//!
//! Centralized test infrastructure for the estima workspace:
//! - Mock pricing functions with scripted totals, latency, gates and failures
//! - Proptest generators for requests
//! - Test fixtures for common scenarios
//! - Custom assertions for pricing results and telemetry

// Re-export core types for convenience
pub use estima_core::{
    build_key, AnnotatedPricingResponse, AttrValue, CatalogVersion, EngineConfig, EstimaError,
    EstimaResult, EstimatePolicy, ManualTimeSource, PriceBreakdown, PricingRequest,
    PricingResponse, ProcessType, Provenance, QuantityBreak, QuoteStatus, StableKey,
    TransportError, ValidationError,
};
pub use estima_engine::{
    PriceNotifier, PricingFunction, RecordingSink, RollbackNotice, TelemetryEvent,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fixture_key(request: &PricingRequest) -> StableKey {
    build_key(request).unwrap_or_else(|e| panic!("fixture request is invalid: {e}"))
}

// ============================================================================
// MOCK PRICING FUNCTIONS
// ============================================================================

#[derive(Debug, Clone, Default)]
struct Script {
    total: Option<f64>,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
    failure: Option<EstimaError>,
    from_cache: bool,
}

/// Pricing function whose behavior is scripted per request.
///
/// Unscripted requests are priced at `per_unit * quantity`. Scripts are keyed
/// by stable key, so logically equal requests share a script.
#[derive(Debug)]
pub struct ScriptedPricing {
    per_unit: f64,
    catalog_version: Mutex<CatalogVersion>,
    scripts: Mutex<HashMap<StableKey, Script>>,
    calls: AtomicU32,
    completed: AtomicU32,
    calls_by_key: Mutex<HashMap<StableKey, u32>>,
}

impl Default for ScriptedPricing {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ScriptedPricing {
    pub fn new(per_unit: f64) -> Self {
        Self {
            per_unit,
            catalog_version: Mutex::new(CatalogVersion::new("v1")),
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            calls_by_key: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, request: &PricingRequest, edit: impl FnOnce(&mut Script)) -> &Self {
        let key = fixture_key(request);
        edit(lock(&self.scripts).entry(key).or_default());
        self
    }

    /// Answer `request` with `total`.
    pub fn with_total(&self, request: &PricingRequest, total: f64) -> &Self {
        self.script(request, |s| s.total = Some(total))
    }

    /// Delay the answer for `request`.
    pub fn with_delay(&self, request: &PricingRequest, delay: Duration) -> &Self {
        self.script(request, |s| s.delay = Some(delay))
    }

    /// Fail every fetch of `request` with `error`.
    pub fn fail_with(&self, request: &PricingRequest, error: EstimaError) -> &Self {
        self.script(request, |s| s.failure = Some(error))
    }

    pub fn clear_failure(&self, request: &PricingRequest) -> &Self {
        self.script(request, |s| s.failure = None)
    }

    /// Mark answers for `request` as served from the pricing service's cache.
    pub fn answer_from_cache(&self, request: &PricingRequest) -> &Self {
        self.script(request, |s| s.from_cache = true)
    }

    /// Hold fetches of `request` until the returned gate is notified.
    pub fn gate(&self, request: &PricingRequest) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        let held = Arc::clone(&gate);
        self.script(request, move |s| s.gate = Some(held));
        gate
    }

    pub fn set_catalog_version(&self, version: impl Into<CatalogVersion>) {
        *lock(&self.catalog_version) = version.into();
    }

    /// Fetches started.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that returned, successfully or not.
    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, request: &PricingRequest) -> u32 {
        lock(&self.calls_by_key)
            .get(&fixture_key(request))
            .copied()
            .unwrap_or(0)
    }

    /// Yield until at least `n` fetches have started.
    pub async fn wait_for_calls(&self, n: u32) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl PricingFunction for ScriptedPricing {
    async fn fetch_price(&self, request: &PricingRequest) -> EstimaResult<PricingResponse> {
        let key = build_key(request)?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls_by_key).entry(key.clone()).or_insert(0) += 1;

        let script = lock(&self.scripts).get(&key).cloned().unwrap_or_default();
        if let Some(gate) = script.gate {
            gate.notified().await;
        }
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = script.failure {
            return Err(error);
        }

        let total = script
            .total
            .unwrap_or(self.per_unit * f64::from(request.quantity));
        let mut response = fixtures::response(total, request.quantity);
        response.catalog_version = lock(&self.catalog_version).clone();
        response.from_cache = script.from_cache;
        Ok(response)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Notifier that records every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    rollbacks: Mutex<Vec<RollbackNotice>>,
    slow: Mutex<Vec<(StableKey, Duration)>>,
    failures: Mutex<Vec<(StableKey, EstimaError)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rollbacks(&self) -> Vec<RollbackNotice> {
        lock(&self.rollbacks).clone()
    }

    pub fn slow_fetches(&self) -> Vec<(StableKey, Duration)> {
        lock(&self.slow).clone()
    }

    pub fn failures(&self) -> Vec<(StableKey, EstimaError)> {
        lock(&self.failures).clone()
    }
}

impl PriceNotifier for RecordingNotifier {
    fn on_rollback(&self, notice: &RollbackNotice) {
        lock(&self.rollbacks).push(notice.clone());
    }

    fn on_slow_fetch(&self, key: &StableKey, elapsed: Duration) {
        lock(&self.slow).push((key.clone(), elapsed));
    }

    fn on_failure(&self, key: &StableKey, error: &EstimaError) {
        lock(&self.failures).push((key.clone(), error.clone()));
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for pricing requests.

    use super::*;
    use proptest::collection::{btree_map, vec};
    use proptest::option;
    use proptest::prelude::*;

    pub fn arb_id() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{0,11}"
    }

    pub fn arb_process() -> impl Strategy<Value = ProcessType> {
        prop_oneof![
            Just(ProcessType::CncMilling),
            Just(ProcessType::CncTurning),
            Just(ProcessType::SheetMetal),
            Just(ProcessType::InjectionMolding),
        ]
    }

    pub fn arb_quantity() -> impl Strategy<Value = u32> {
        1u32..10_000
    }

    pub fn arb_attr_value() -> impl Strategy<Value = AttrValue> {
        prop_oneof![
            any::<bool>().prop_map(AttrValue::Flag),
            (-1.0e6f64..1.0e6).prop_map(AttrValue::Number),
            "[ -~]{0,12}".prop_map(AttrValue::Text),
            vec("[a-z;=,]{1,6}", 0..4).prop_map(AttrValue::List),
        ]
    }

    /// Any valid request.
    pub fn arb_request() -> impl Strategy<Value = PricingRequest> {
        (
            (arb_id(), arb_process(), arb_id(), arb_id(), arb_quantity()),
            (
                vec(arb_id(), 0..4),
                option::of(arb_id()),
                option::of(arb_id()),
                any::<bool>(),
                btree_map("[a-z_]{1,8}", arb_attr_value(), 0..4),
            ),
        )
            .prop_map(
                |(
                    (part_id, process, material_id, machine_id, quantity),
                    (finish_ids, tolerance_id, lead_time_id, is_rush, attributes),
                )| PricingRequest {
                    part_id,
                    process,
                    material_id,
                    machine_id,
                    quantity,
                    finish_ids,
                    tolerance_id,
                    lead_time_id,
                    is_rush,
                    attributes,
                },
            )
    }

    /// A request and a copy of it with only the quantity changed.
    pub fn arb_quantity_edit() -> impl Strategy<Value = (PricingRequest, PricingRequest)> {
        (arb_request(), arb_quantity())
            .prop_filter("quantity must change", |(request, qty)| request.quantity != *qty)
            .prop_map(|(request, qty)| {
                let edited = request.with_quantity(qty);
                (request, edited)
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common pricing scenarios.

    use super::*;

    /// The reference request: an aluminium bracket milled on a Haas.
    pub fn base_request(quantity: u32) -> PricingRequest {
        PricingRequest::builder()
            .part_id("bracket-rev-a")
            .process(ProcessType::CncMilling)
            .material_id("aluminum-6061")
            .machine_id("haas-vf2")
            .quantity(quantity)
            .build()
            .unwrap_or_else(|e| panic!("base request is invalid: {e}"))
    }

    /// `base_request` with rush toggled on.
    pub fn rush_request(quantity: u32) -> PricingRequest {
        let mut request = base_request(quantity);
        request.is_rush = true;
        request
    }

    /// A quoted response with an empty breakdown.
    pub fn response(total: f64, quantity: u32) -> PricingResponse {
        PricingResponse {
            total_price: total,
            unit_price: total / f64::from(quantity.max(1)),
            currency: "USD".to_string(),
            pricing_hash: format!("ph_{quantity}_{total}"),
            catalog_version: CatalogVersion::new("v1"),
            lead_time_days: 7,
            breakdown: PriceBreakdown::default(),
            quantity_breaks: vec![],
            status: QuoteStatus::Quoted,
            from_cache: false,
        }
    }

    pub fn quantity_breaks() -> Vec<QuantityBreak> {
        vec![
            QuantityBreak {
                min_qty: 1,
                max_qty: Some(9),
                unit_price: 60.0,
                discount_pct: 0.0,
            },
            QuantityBreak {
                min_qty: 10,
                max_qty: Some(49),
                unit_price: 50.0,
                discount_pct: 16.7,
            },
            QuantityBreak {
                min_qty: 50,
                max_qty: None,
                unit_price: 42.0,
                discount_pct: 30.0,
            },
        ]
    }

    pub fn server_entry(request: &PricingRequest, total: f64) -> AnnotatedPricingResponse {
        AnnotatedPricingResponse::server(response(total, request.quantity), request.clone())
    }

    /// Engine configuration without retries or backoff.
    pub fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_fetch_retries(0)
            .with_retry_backoff_ms(1)
    }

    /// A policy whose rush toggle scales the price by `multiplier`.
    pub fn rush_policy(multiplier: f64) -> EstimatePolicy {
        EstimatePolicy {
            rush_multiplier: multiplier,
            ..EstimatePolicy::default()
        }
    }

    pub fn network_error() -> EstimaError {
        TransportError::Network {
            reason: "connection reset by peer".to_string(),
        }
        .into()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for pricing results and telemetry.

    use super::*;

    #[track_caller]
    pub fn assert_total_near(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "Expected total {expected}, got {actual}"
        );
    }

    #[track_caller]
    pub fn assert_server(price: &AnnotatedPricingResponse) {
        assert_eq!(
            price.provenance,
            Provenance::Server,
            "Expected server price, got {:?}",
            price
        );
    }

    #[track_caller]
    pub fn assert_optimistic(price: &AnnotatedPricingResponse) {
        assert_eq!(
            price.provenance,
            Provenance::Optimistic,
            "Expected optimistic price, got {:?}",
            price
        );
        let confidence = price.confidence.unwrap_or(-1.0);
        assert!(
            (0.0..=1.0).contains(&confidence),
            "Optimistic confidence {confidence} outside [0, 1]"
        );
    }

    /// Assert a validation error naming `field`.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &EstimaResult<T>, field: &str) {
        match result {
            Err(EstimaError::Validation(e)) => {
                assert_eq!(e.field(), field, "Wrong field in validation error")
            }
            other => panic!("Expected validation error for {field}, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_transport_error<T: std::fmt::Debug>(result: &EstimaResult<T>) {
        match result {
            Err(EstimaError::Transport(_)) => {}
            other => panic!("Expected transport error, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_event_count(sink: &RecordingSink, kind: &str, expected: usize) {
        let actual = sink.count(kind);
        assert_eq!(
            actual, expected,
            "Expected {expected} `{kind}` events, got {actual}: {:?}",
            sink.events()
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================
