//! Catalog-version driven invalidation.

use std::sync::{Arc, RwLock};

use estima_cache::RequestCache;
use estima_core::{CatalogVersion, EstimaResult, InvalidationMode};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Result of one invalidation sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationReport {
    pub version: CatalogVersion,
    /// Live entries before the sweep.
    pub scanned: usize,
    /// Entries evicted or marked stale.
    pub affected: usize,
    pub mode: InvalidationMode,
}

/// Invalidates cached prices computed under another catalog version.
pub struct InvalidationController {
    cache: Arc<RequestCache>,
    mode: InvalidationMode,
    telemetry: Arc<dyn TelemetrySink>,
    current: RwLock<Option<CatalogVersion>>,
}

impl std::fmt::Debug for InvalidationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationController")
            .field("mode", &self.mode)
            .field("current", &self.current_version())
            .finish()
    }
}

impl InvalidationController {
    pub fn new(
        cache: Arc<RequestCache>,
        mode: InvalidationMode,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            cache,
            mode,
            telemetry,
            current: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> InvalidationMode {
        self.mode
    }

    /// Last version seen, if any.
    pub fn current_version(&self) -> Option<CatalogVersion> {
        self.current.read().ok()?.clone()
    }

    /// Evict (or mark stale) every entry whose catalog version differs from
    /// `version`.
    ///
    /// The sweep locks one cache shard at a time, so reads and writes for
    /// keys in other shards proceed while it runs. The version is pinned in
    /// the cache first: a fetch still in flight that answers under an older
    /// version is stored as already invalidated.
    pub fn on_catalog_version_change(
        &self,
        version: impl Into<CatalogVersion>,
    ) -> EstimaResult<InvalidationReport> {
        let version = version.into();
        self.cache.pin_catalog_version(version.clone(), self.mode)?;
        let scanned = self.cache.len();
        let affected = self
            .cache
            .invalidate_where(|entry| *entry.data.catalog_version() != version, self.mode)?;

        if let Ok(mut current) = self.current.write() {
            *current = Some(version.clone());
        }

        tracing::info!(
            version = %version,
            scanned,
            affected,
            mode = %self.mode,
            "catalog version changed"
        );
        self.telemetry.record(TelemetryEvent::Metric {
            at: self.cache.now(),
            name: "invalidation.evicted".to_string(),
            value: affected as f64,
        });

        Ok(InvalidationReport {
            version,
            scanned,
            affected,
            mode: self.mode,
        })
    }

    /// Forward every change on `versions` into
    /// [`on_catalog_version_change`](Self::on_catalog_version_change).
    ///
    /// The value present at the call is recorded as current and pinned
    /// without sweeping. The task ends when the sender is dropped.
    pub fn watch_catalog(self: Arc<Self>, mut versions: watch::Receiver<String>) -> JoinHandle<()> {
        let initial = CatalogVersion::new(versions.borrow_and_update().clone());
        if let Err(e) = self.cache.pin_catalog_version(initial.clone(), self.mode) {
            tracing::warn!(error = %e, "could not pin initial catalog version");
        }
        if let Ok(mut current) = self.current.write() {
            *current = Some(initial);
        }

        tokio::spawn(async move {
            while versions.changed().await.is_ok() {
                let version = versions.borrow_and_update().clone();
                if let Err(e) = self.on_catalog_version_change(version) {
                    tracing::warn!(error = %e, "catalog invalidation failed");
                }
            }
            tracing::debug!("catalog version channel closed");
        })
    }
}
