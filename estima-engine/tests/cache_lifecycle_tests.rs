//! Freshness, eviction and catalog invalidation seen through the engine.

use std::sync::Arc;
use std::time::Duration;

use estima_cache::MissReason;
use estima_core::{CatalogVersion, InvalidationMode, ManualTimeSource};
use estima_engine::{PricingEngine, RecordingSink, TelemetryEvent};
use estima_test_utils::assertions::{assert_event_count, assert_server, assert_total_near};
use estima_test_utils::fixtures::{base_request, fast_config};
use estima_test_utils::ScriptedPricing;
use tokio::sync::watch;

struct Harness {
    engine: PricingEngine,
    pricing: Arc<ScriptedPricing>,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualTimeSource>,
}

fn harness(mode: InvalidationMode) -> Harness {
    let pricing = Arc::new(ScriptedPricing::default());
    let sink = Arc::new(RecordingSink::new(256));
    let clock = Arc::new(ManualTimeSource::starting_now());
    let engine = PricingEngine::builder(pricing.clone())
        .config(fast_config().with_invalidation_mode(mode))
        .clock(clock.clone())
        .telemetry(sink.clone())
        .build()
        .unwrap();
    Harness {
        engine,
        pricing,
        sink,
        clock,
    }
}

fn miss_reasons(sink: &RecordingSink) -> Vec<MissReason> {
    sink.events()
        .into_iter()
        .filter_map(|event| match event {
            TelemetryEvent::CacheMiss { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_fresh_entry_is_not_refetched() {
    let h = harness(InvalidationMode::Evict);
    let request = base_request(3);
    h.engine.prefetch(&request).await.unwrap();

    h.clock.advance_ms(59_000);
    assert!(h.engine.prefetch(&request).await.unwrap().from_memory);
    assert_eq!(h.pricing.calls(), 1);
}

#[tokio::test]
async fn test_stale_entry_served_then_refreshed() {
    let h = harness(InvalidationMode::Evict);
    let request = base_request(3);
    h.engine.prefetch(&request).await.unwrap();

    h.clock.advance_ms(60_001);
    let stale = h.engine.get_current_price(&request).unwrap().unwrap();
    assert_total_near(stale.total_price(), 30.0);

    let refreshed = h.engine.prefetch(&request).await.unwrap();
    assert!(!refreshed.from_memory);
    assert_eq!(h.pricing.calls(), 2);
    assert_eq!(miss_reasons(&h.sink), vec![MissReason::Cold, MissReason::Expired]);
    assert_eq!(h.engine.cache_stats().stale_hits, 1);
}

#[tokio::test]
async fn test_untouched_entry_evicted_after_gc_time() {
    let h = harness(InvalidationMode::Evict);
    let request = base_request(3);
    h.engine.prefetch(&request).await.unwrap();

    h.clock.advance_ms(600_000);
    assert!(h.engine.get_current_price(&request).unwrap().is_none());

    h.engine.prefetch(&request).await.unwrap();
    assert_eq!(h.pricing.calls(), 2);
    assert_eq!(miss_reasons(&h.sink).last(), Some(&MissReason::Expired));
    assert_eq!(h.engine.cache_stats().evictions, 1);
}

#[tokio::test]
async fn test_reads_keep_entry_alive() {
    let h = harness(InvalidationMode::Evict);
    let request = base_request(3);
    h.engine.prefetch(&request).await.unwrap();

    for _ in 0..3 {
        h.clock.advance_ms(400_000);
        assert!(h.engine.get_current_price(&request).unwrap().is_some());
    }
}

#[tokio::test]
async fn test_catalog_change_evicts_and_refetches() {
    let h = harness(InvalidationMode::Evict);
    let a = base_request(1);
    let b = base_request(2);
    h.engine.prefetch(&a).await.unwrap();
    h.engine.prefetch(&b).await.unwrap();

    h.pricing.set_catalog_version("v2");
    let report = h.engine.on_catalog_version_change("v2").unwrap();
    assert_eq!(report.affected, 2);
    assert_eq!(h.engine.current_catalog_version(), Some(CatalogVersion::new("v2")));
    assert_event_count(&h.sink, "metric", 1);

    // the old value stays readable as a placeholder
    let placeholder = h.engine.get_current_price(&a).unwrap().unwrap();
    assert_eq!(placeholder.catalog_version(), &CatalogVersion::new("v1"));

    let refreshed = h.engine.prefetch(&a).await.unwrap();
    assert_eq!(refreshed.response.catalog_version, CatalogVersion::new("v2"));
    assert_eq!(miss_reasons(&h.sink).last(), Some(&MissReason::Invalidated));

    let again = h.engine.on_catalog_version_change("v2").unwrap();
    assert_eq!(again.affected, 0);
}

#[tokio::test]
async fn test_fetch_spanning_catalog_change_is_not_served_fresh() {
    let h = harness(InvalidationMode::Evict);
    let request = base_request(4);
    let gate = h.pricing.gate(&request);

    let pending = {
        let engine = h.engine.clone();
        let request = request.clone();
        tokio::spawn(async move { engine.prefetch(&request).await })
    };
    h.pricing.wait_for_calls(1).await;

    h.engine.on_catalog_version_change("v2").unwrap();
    gate.notify_one();
    let late = pending.await.unwrap().unwrap();
    assert!(late.outdated_catalog);
    assert_eq!(late.response.catalog_version, CatalogVersion::new("v1"));

    let key = estima_core::build_key(&request).unwrap();
    assert_eq!(
        h.engine.cache().get(&key).unwrap(),
        estima_cache::Lookup::Miss(MissReason::Invalidated)
    );
    // still shown while the refetch runs
    let placeholder = h.engine.get_current_price(&request).unwrap().unwrap();
    assert_eq!(placeholder.catalog_version(), &CatalogVersion::new("v1"));

    h.pricing.set_catalog_version("v2");
    let refreshed = h.engine.prefetch(&request).await.unwrap();
    assert!(!refreshed.from_memory && !refreshed.outdated_catalog);
    assert_eq!(refreshed.response.catalog_version, CatalogVersion::new("v2"));
    assert_eq!(h.pricing.calls(), 2);
    assert!(h.engine.prefetch(&request).await.unwrap().from_memory);
}

#[tokio::test]
async fn test_mark_stale_mode_refetches_without_dropping() {
    let h = harness(InvalidationMode::MarkStale);
    let request = base_request(1);
    h.engine.prefetch(&request).await.unwrap();

    let report = h.engine.on_catalog_version_change("v2").unwrap();
    assert_eq!(report.affected, 1);
    assert_eq!(h.engine.cache().len(), 1);

    assert!(!h.engine.prefetch(&request).await.unwrap().from_memory);
    assert_eq!(h.pricing.calls(), 2);
    assert_eq!(miss_reasons(&h.sink).last(), Some(&MissReason::Expired));
}

#[tokio::test]
async fn test_watch_catalog_forwards_versions() {
    let h = harness(InvalidationMode::Evict);
    h.engine.prefetch(&base_request(1)).await.unwrap();

    let (tx, rx) = watch::channel("v1".to_string());
    let task = h.engine.watch_catalog(rx);
    tx.send("v2".to_string()).unwrap();
    drop(tx);
    task.await.unwrap();

    assert!(h.engine.cache().is_empty());
    assert_server(&h.engine.get_current_price(&base_request(1)).unwrap().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_gc_task_sweeps_expired_entries() {
    let h = harness(InvalidationMode::Evict);
    h.engine.prefetch(&base_request(1)).await.unwrap();
    let gc = h.engine.spawn_gc();

    h.clock.advance_ms(600_001);
    tokio::time::sleep(Duration::from_millis(30_001)).await;
    tokio::task::yield_now().await;

    assert!(h.engine.cache().is_empty());
    assert_eq!(h.engine.cache_stats().evictions, 1);
    gc.abort();
}
