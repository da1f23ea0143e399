//! Caller-facing entry point.
//!
//! A [`PricingEngine`] owns one cache, one single-flight registry and one
//! invalidation controller. It is constructed explicitly and shared by
//! cloning; there is no process-wide instance.

use std::sync::Arc;

use estima_cache::{CacheRead, CacheStats, RequestCache};
use estima_core::{
    build_key, AnnotatedPricingResponse, CatalogVersion, EngineConfig, EstimaResult,
    PricingRequest, SystemTimeSource, TimeSource,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::invalidation::{InvalidationController, InvalidationReport};
use crate::notify::{NoopNotifier, PriceNotifier};
use crate::provider::PricingFunction;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::session::{PriceSession, SessionDirectory};
use crate::telemetry::{TelemetrySink, TracingSink};

struct EngineInner {
    config: EngineConfig,
    cache: Arc<RequestCache>,
    reconciler: Reconciler,
    invalidation: Arc<InvalidationController>,
    sessions: Arc<SessionDirectory>,
}

/// Optimistic pricing over a shared request cache.
#[derive(Clone)]
pub struct PricingEngine {
    inner: Arc<EngineInner>,
    default_session: Arc<PriceSession>,
}

impl std::fmt::Debug for PricingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PricingEngine")
            .field("config", &self.inner.config)
            .field("cache", &self.inner.cache)
            .finish()
    }
}

impl PricingEngine {
    pub fn builder<P>(pricing: P) -> PricingEngineBuilder
    where
        P: PricingFunction + 'static,
    {
        PricingEngineBuilder::new(Arc::new(pricing))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<RequestCache> {
        &self.inner.cache
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    /// Non-blocking read of the cached price for `request`, including a
    /// retained placeholder.
    pub fn get_current_price(
        &self,
        request: &PricingRequest,
    ) -> EstimaResult<Option<AnnotatedPricingResponse>> {
        let key = build_key(request)?;
        Ok(self
            .inner
            .cache
            .read_with_placeholder(&key)
            .map(CacheRead::into_value))
    }

    /// Optimistic apply plus reconciliation through the engine's default
    /// session. Views that edit independently should each use their own
    /// [`session`](Self::session).
    pub async fn update_price(&self, request: &PricingRequest) -> EstimaResult<ReconcileOutcome> {
        self.default_session.update_price(request).await
    }

    /// Warm the cache for `request` without affecting any session.
    pub async fn prefetch(&self, request: &PricingRequest) -> EstimaResult<ReconcileOutcome> {
        self.inner.reconciler.reconcile(request).await
    }

    pub fn default_session(&self) -> &Arc<PriceSession> {
        &self.default_session
    }

    /// A new, empty session sharing this engine's cache.
    pub fn session(&self) -> PriceSession {
        PriceSession::new(
            self.inner.reconciler.clone(),
            Arc::clone(&self.inner.sessions),
        )
    }

    pub fn on_catalog_version_change(
        &self,
        version: impl Into<CatalogVersion>,
    ) -> EstimaResult<InvalidationReport> {
        self.inner.invalidation.on_catalog_version_change(version)
    }

    /// Invalidate on every version published on `versions`.
    pub fn watch_catalog(&self, versions: watch::Receiver<String>) -> JoinHandle<()> {
        Arc::clone(&self.inner.invalidation).watch_catalog(versions)
    }

    pub fn current_catalog_version(&self) -> Option<CatalogVersion> {
        self.inner.invalidation.current_version()
    }

    /// Start the periodic gc sweep at the configured interval.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        self.inner
            .cache
            .spawn_gc(self.inner.config.gc_sweep_interval())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }
}

/// Builder for [`PricingEngine`].
pub struct PricingEngineBuilder {
    pricing: Arc<dyn PricingFunction>,
    config: EngineConfig,
    clock: Arc<dyn TimeSource>,
    telemetry: Arc<dyn TelemetrySink>,
    notifier: Arc<dyn PriceNotifier>,
}

impl PricingEngineBuilder {
    fn new(pricing: Arc<dyn PricingFunction>) -> Self {
        Self {
            pricing,
            config: EngineConfig::default(),
            clock: Arc::new(SystemTimeSource),
            telemetry: Arc::new(TracingSink),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn PriceNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validate the configuration and assemble the engine.
    pub fn build(self) -> EstimaResult<PricingEngine> {
        self.config.validate()?;

        let cache = Arc::new(RequestCache::new(&self.config, self.clock));
        let sessions = Arc::new(SessionDirectory::new(self.notifier));
        let reconciler = Reconciler::new(
            Arc::clone(&cache),
            self.pricing,
            Arc::clone(&self.telemetry),
            Arc::clone(&sessions) as Arc<dyn PriceNotifier>,
            &self.config,
        );
        let invalidation = Arc::new(InvalidationController::new(
            Arc::clone(&cache),
            self.config.invalidation_mode,
            self.telemetry,
        ));
        let default_session = Arc::new(PriceSession::new(reconciler.clone(), Arc::clone(&sessions)));

        tracing::debug!(
            stale_time_ms = self.config.stale_time_ms,
            gc_time_ms = self.config.gc_time_ms,
            rollback_threshold = self.config.rollback_threshold,
            "pricing engine built"
        );

        Ok(PricingEngine {
            inner: Arc::new(EngineInner {
                config: self.config,
                cache,
                reconciler,
                invalidation,
                sessions,
            }),
            default_session,
        })
    }
}
