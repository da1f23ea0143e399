//! Reconciliation scenarios: optimistic apply, rollback, stale discard,
//! idempotence and failure handling, driven through `PriceSession`.

use std::sync::Arc;
use std::time::Duration;

use estima_core::{build_key, AnnotatedPricingResponse, EngineConfig, Provenance};
use estima_engine::{PricingEngine, RecordingSink, TelemetryEvent};
use estima_test_utils::assertions::{
    assert_event_count, assert_optimistic, assert_server, assert_total_near,
    assert_transport_error,
};
use estima_test_utils::fixtures::{
    base_request, fast_config, network_error, response, rush_policy, rush_request,
};
use estima_test_utils::{RecordingNotifier, ScriptedPricing};

struct Harness {
    engine: PricingEngine,
    pricing: Arc<ScriptedPricing>,
    sink: Arc<RecordingSink>,
    notifier: Arc<RecordingNotifier>,
}

fn harness(config: EngineConfig) -> Harness {
    let pricing = Arc::new(ScriptedPricing::default());
    let sink = Arc::new(RecordingSink::new(256));
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = PricingEngine::builder(pricing.clone())
        .config(config)
        .telemetry(sink.clone())
        .notifier(notifier.clone())
        .build()
        .unwrap();
    Harness {
        engine,
        pricing,
        sink,
        notifier,
    }
}

// ============================================================================
// END-TO-END
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cold_then_quantity_change_end_to_end() {
    let h = harness(fast_config());
    let ten = base_request(10);
    let twenty = base_request(20);
    h.pricing.with_total(&ten, 500.0).with_total(&twenty, 900.0);
    let gate = h.pricing.gate(&twenty);

    let session = Arc::new(h.engine.session());

    let first = session.update_price(&ten).await.unwrap();
    assert_total_near(first.response.total_price, 500.0);
    assert!(first.deviation.is_none());
    assert_event_count(&h.sink, "optimistic_update_applied", 0);
    let shown = session.current_price().unwrap();
    assert_server(&shown);
    assert_total_near(shown.total_price(), 500.0);

    let pending = {
        let session = session.clone();
        let twenty = twenty.clone();
        tokio::spawn(async move { session.update_price(&twenty).await })
    };
    h.pricing.wait_for_calls(2).await;

    let optimistic = session.current_price().unwrap();
    assert_optimistic(&optimistic);
    assert_total_near(optimistic.total_price(), 950.0);
    assert!(optimistic.confidence.unwrap() > 0.5);
    assert_event_count(&h.sink, "optimistic_update_applied", 1);

    gate.notify_one();
    let outcome = pending.await.unwrap().unwrap();
    assert!(!outcome.rolled_back);
    assert!(!outcome.superseded);
    assert!((outcome.deviation.unwrap() - 50.0 / 900.0).abs() < 1e-9);

    let settled = session.current_price().unwrap();
    assert_server(&settled);
    assert_total_near(settled.total_price(), 900.0);
    assert_event_count(&h.sink, "optimistic_update_rollback", 0);
    assert!(h.notifier.rollbacks().is_empty());
}

// ============================================================================
// ROLLBACK
// ============================================================================

async fn rush_toggle(multiplier: f64) -> Harness {
    let h = harness(fast_config().with_estimate_policy(rush_policy(multiplier)));
    h.pricing
        .with_total(&base_request(10), 100.0)
        .with_total(&rush_request(10), 100.0);

    let session = h.engine.session();
    session.update_price(&base_request(10)).await.unwrap();
    session.update_price(&rush_request(10)).await.unwrap();
    h
}

#[tokio::test]
async fn test_small_deviation_does_not_roll_back() {
    let h = rush_toggle(0.96).await;

    assert_event_count(&h.sink, "optimistic_update_applied", 1);
    assert_event_count(&h.sink, "optimistic_update_rollback", 0);
    assert!(h.notifier.rollbacks().is_empty());

    let price = h.engine.get_current_price(&rush_request(10)).unwrap().unwrap();
    assert_server(&price);
    assert_total_near(price.total_price(), 100.0);
}

#[tokio::test]
async fn test_large_deviation_rolls_back_once() {
    let h = rush_toggle(0.8).await;

    assert_event_count(&h.sink, "optimistic_update_rollback", 1);
    let rollback = h
        .sink
        .events()
        .into_iter()
        .find_map(|event| match event {
            TelemetryEvent::OptimisticRollback {
                optimistic_total,
                server_total,
                deviation,
                ..
            } => Some((optimistic_total, server_total, deviation)),
            _ => None,
        })
        .unwrap();
    assert_total_near(rollback.0, 80.0);
    assert_total_near(rollback.1, 100.0);
    assert!((rollback.2 - 0.2).abs() < 1e-9);

    let notices = h.notifier.rollbacks();
    assert_eq!(notices.len(), 1);
    assert_total_near(notices[0].server_total, 100.0);

    let price = h.engine.get_current_price(&rush_request(10)).unwrap().unwrap();
    assert_eq!(price.provenance, Provenance::Server);
    assert_total_near(price.total_price(), 100.0);
    assert!((h.sink.rollback_rate(None) - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_zero_server_total_always_rolls_back() {
    let h = harness(fast_config().with_estimate_policy(rush_policy(1.0)));
    h.pricing
        .with_total(&base_request(10), 0.0)
        .with_total(&rush_request(10), 0.0);

    let session = h.engine.session();
    session.update_price(&base_request(10)).await.unwrap();
    let outcome = session.update_price(&rush_request(10)).await.unwrap();
    assert!(outcome.rolled_back);
    assert!(outcome.deviation.unwrap().is_infinite());
}

/// Yield until `n` callers have attached to an already running fetch.
async fn wait_for_joins(h: &Harness, n: u64) {
    while h.engine.reconciler().inflight().coalesced() < n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_rollback_announced_to_session_that_joined_a_prefetch() {
    let h = harness(fast_config().with_estimate_policy(rush_policy(0.5)));
    let base = base_request(10);
    let rush = rush_request(10);
    h.pricing.with_total(&base, 100.0).with_total(&rush, 100.0);

    let session = Arc::new(h.engine.session());
    session.update_price(&base).await.unwrap();

    let gate = h.pricing.gate(&rush);
    let hover = {
        let engine = h.engine.clone();
        let rush = rush.clone();
        tokio::spawn(async move { engine.prefetch(&rush).await })
    };
    h.pricing.wait_for_calls(2).await;

    let edit = {
        let session = session.clone();
        let rush = rush.clone();
        tokio::spawn(async move { session.update_price(&rush).await })
    };
    wait_for_joins(&h, 1).await;
    assert_total_near(session.current_price().unwrap().total_price(), 50.0);

    gate.notify_one();
    hover.await.unwrap().unwrap();
    let outcome = edit.await.unwrap().unwrap();
    assert!(outcome.rolled_back);
    assert!(outcome.coalesced);
    assert!(!outcome.superseded);
    assert_eq!(h.pricing.calls(), 2);

    assert_event_count(&h.sink, "optimistic_update_rollback", 1);
    let notices = h.notifier.rollbacks();
    assert_eq!(notices.len(), 1);
    assert_total_near(notices[0].optimistic_total, 50.0);
    assert_total_near(notices[0].server_total, 100.0);
}

#[tokio::test]
async fn test_one_notice_per_session_for_a_shared_flight() {
    let h = harness(fast_config().with_estimate_policy(rush_policy(0.5)));
    let base = base_request(10);
    let rush = rush_request(10);
    h.pricing.with_total(&base, 100.0).with_total(&rush, 100.0);

    let session = Arc::new(h.engine.session());
    session.update_price(&base).await.unwrap();

    let gate = h.pricing.gate(&rush);
    let first = {
        let session = session.clone();
        let rush = rush.clone();
        tokio::spawn(async move { session.update_price(&rush).await })
    };
    h.pricing.wait_for_calls(2).await;
    let second = {
        let session = session.clone();
        let rush = rush.clone();
        tokio::spawn(async move { session.update_price(&rush).await })
    };
    wait_for_joins(&h, 1).await;

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert!(first.rolled_back && second.rolled_back);
    assert_eq!(first.flight_seq, second.flight_seq);
    assert_eq!(h.notifier.rollbacks().len(), 1);
}

#[tokio::test]
async fn test_deviation_uses_the_optimistic_price_actually_replaced() {
    let h = harness(fast_config().with_estimate_policy(rush_policy(0.96)));
    let base = base_request(10);
    let rush = rush_request(10);
    h.pricing.with_total(&base, 100.0).with_total(&rush, 100.0);

    let session = Arc::new(h.engine.session());
    session.update_price(&base).await.unwrap();

    let gate = h.pricing.gate(&rush);
    let pending = {
        let session = session.clone();
        let rush = rush.clone();
        tokio::spawn(async move { session.update_price(&rush).await })
    };
    h.pricing.wait_for_calls(2).await;

    // another view writes a newer estimate for the same key mid-flight
    let key = build_key(&rush).unwrap();
    h.engine
        .cache()
        .set(
            &key,
            AnnotatedPricingResponse::optimistic(response(60.0, 10), rush.clone(), 0.5),
        )
        .unwrap();

    gate.notify_one();
    let outcome = pending.await.unwrap().unwrap();
    assert_eq!(outcome.optimistic_total, Some(60.0));
    assert!(outcome.rolled_back);
    assert!((outcome.deviation.unwrap() - 0.4).abs() < 1e-9);
    assert_event_count(&h.sink, "optimistic_update_rollback", 1);
}

// ============================================================================
// STALE OVERWRITE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_late_result_does_not_replace_current_request() {
    let h = harness(fast_config());
    let a = base_request(10);
    let b = base_request(20);
    h.pricing.with_total(&a, 500.0).with_total(&b, 900.0);
    let gate_a = h.pricing.gate(&a);

    let session = Arc::new(h.engine.session());
    let slow = {
        let session = session.clone();
        let a = a.clone();
        tokio::spawn(async move { session.update_price(&a).await })
    };
    h.pricing.wait_for_calls(1).await;

    let fast = session.update_price(&b).await.unwrap();
    assert!(!fast.superseded);
    assert_total_near(session.current_price().unwrap().total_price(), 900.0);

    gate_a.notify_one();
    let late = slow.await.unwrap().unwrap();
    assert!(late.superseded);
    assert_total_near(late.response.total_price, 500.0);

    // the late result lands under its own key only
    let shown = session.current_price().unwrap();
    assert_server(&shown);
    assert_total_near(shown.total_price(), 900.0);
    assert_eq!(session.current_request(), Some(b.clone()));
    assert_total_near(
        h.engine.get_current_price(&a).unwrap().unwrap().total_price(),
        500.0,
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_superseded_rollback_is_not_announced() {
    let h = harness(fast_config().with_estimate_policy(rush_policy(0.5)));
    let base = base_request(10);
    let rush = rush_request(10);
    let other = base_request(11);
    h.pricing.with_total(&base, 100.0).with_total(&rush, 100.0);

    let session = Arc::new(h.engine.session());
    session.update_price(&base).await.unwrap();

    let gate = h.pricing.gate(&rush);
    let pending = {
        let session = session.clone();
        let rush = rush.clone();
        tokio::spawn(async move { session.update_price(&rush).await })
    };
    h.pricing.wait_for_calls(2).await;
    session.update_price(&other).await.unwrap();

    gate.notify_one();
    let outcome = pending.await.unwrap().unwrap();
    assert!(outcome.rolled_back);
    assert!(outcome.superseded);
    assert_event_count(&h.sink, "optimistic_update_rollback", 1);
    assert!(h.notifier.rollbacks().is_empty());
}

// ============================================================================
// IDEMPOTENCE
// ============================================================================

#[tokio::test]
async fn test_reconcile_twice_matches_once() {
    let h = harness(fast_config());
    let request = base_request(7);

    h.engine.prefetch(&request).await.unwrap();
    let once = h.engine.get_current_price(&request).unwrap();
    let len_once = h.engine.cache().len();

    let second = h.engine.prefetch(&request).await.unwrap();
    assert!(second.from_memory);
    assert_eq!(h.engine.get_current_price(&request).unwrap(), once);
    assert_eq!(h.engine.cache().len(), len_once);
    assert_eq!(h.pricing.calls(), 1);
}

#[tokio::test]
async fn test_network_cache_hit_reported() {
    let h = harness(fast_config());
    let request = base_request(3);
    h.pricing.answer_from_cache(&request);

    h.engine.prefetch(&request).await.unwrap();
    assert_event_count(&h.sink, "price_cache_hit", 1);
    assert_event_count(&h.sink, "price_cache_miss", 0);
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_failure_keeps_optimistic_price_and_notifies() {
    let h = harness(fast_config());
    let ten = base_request(10);
    let twenty = base_request(20);
    h.pricing.with_total(&ten, 500.0);
    h.pricing.fail_with(&twenty, network_error());

    let session = h.engine.session();
    session.update_price(&ten).await.unwrap();
    let result = session.update_price(&twenty).await;
    assert_transport_error(&result);

    let shown = session.current_price().unwrap();
    assert_optimistic(&shown);
    assert_total_near(shown.total_price(), 950.0);
    assert_eq!(h.notifier.failures().len(), 1);
    assert_event_count(&h.sink, "pricing_error", 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_retried_with_default_config() {
    let h = harness(EngineConfig::default());
    let request = base_request(2);
    h.pricing.fail_with(&request, network_error());

    let result = h.engine.prefetch(&request).await;
    assert_transport_error(&result);
    assert_eq!(h.pricing.calls(), 2);

    let retry_count = h.sink.events().into_iter().find_map(|event| match event {
        TelemetryEvent::Error { retry_count, .. } => Some(retry_count),
        _ => None,
    });
    assert_eq!(retry_count, Some(1));
}

#[tokio::test]
async fn test_invalid_request_fails_fast() {
    let h = harness(fast_config());
    let mut request = base_request(2);
    request.part_id.clear();

    let result = h.engine.update_price(&request).await;
    estima_test_utils::assertions::assert_validation_error(&result, "part_id");
    assert_eq!(h.pricing.calls(), 0);
    assert!(h.sink.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_notifies_without_cancelling() {
    let h = harness(fast_config());
    let request = base_request(5);
    h.pricing.with_delay(&request, Duration::from_millis(4_000));

    let session = h.engine.session();
    let outcome = session.update_price(&request).await.unwrap();
    assert_total_near(outcome.response.total_price, 50.0);
    let slow = h.notifier.slow_fetches();
    assert_eq!(slow.len(), 1);
    assert_eq!(slow[0].0, outcome.key);
}

#[tokio::test(start_paused = true)]
async fn test_slow_prefetch_nobody_is_showing_stays_quiet() {
    let h = harness(fast_config());
    let shown = base_request(5);
    let hovered = base_request(6);
    h.pricing.with_delay(&hovered, Duration::from_millis(4_000));

    let session = h.engine.session();
    session.update_price(&shown).await.unwrap();

    let outcome = session.prefetch(&hovered).await.unwrap();
    assert_total_near(outcome.response.total_price, 60.0);
    assert!(h.notifier.slow_fetches().is_empty());
}
