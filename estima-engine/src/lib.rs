//! estima Engine - Optimistic Pricing Reconciliation
//!
//! Shows an instant estimated price while the authoritative price is being
//! fetched, then reconciles: keeps the server value and replaces the estimate,
//! announcing a rollback when the two diverge past the configured threshold.
//!
//! ```text
//!   PriceSession ──► Reconciler ──► EstimateEngine        (sync, pure)
//!                        │    └───► RequestCache          (sync, sharded)
//!                        └──► InFlightRegistry ──► Fetcher ──► PricingFunction (async)
//!   InvalidationController ──► RequestCache
//!   every component ──► TelemetrySink
//! ```

pub mod engine;
pub mod estimate;
pub mod fetch;
pub mod inflight;
pub mod invalidation;
pub mod notify;
pub mod provider;
pub mod reconcile;
pub mod session;
pub mod telemetry;

pub use engine::{PricingEngine, PricingEngineBuilder};
pub use estimate::{Estimate, EstimateEngine};
pub use fetch::{FetchFailure, Fetched, Fetcher};
pub use inflight::{InFlightRegistry, Joined};
pub use invalidation::{InvalidationController, InvalidationReport};
pub use notify::{NoopNotifier, PriceNotifier, RollbackNotice};
pub use provider::PricingFunction;
pub use reconcile::{deviation, FlightResult, ReconcileOutcome, Reconciler};
pub use session::PriceSession;
pub use telemetry::{
    ChannelSink, FanoutSink, HitSource, NullSink, RecordingSink, TelemetryEvent, TelemetrySink,
    TracingSink,
};
