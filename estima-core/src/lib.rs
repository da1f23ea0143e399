//! estima Core - Pricing Data Model
//!
//! Pure data structures and pure functions shared by every estima crate:
//! requests, responses, canonical keys, errors, configuration and the clock
//! abstraction. Nothing here performs I/O or suspends.

use chrono::{DateTime, Utc};

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod request;
pub mod response;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use clock::{ManualTimeSource, SystemTimeSource, TimeSource};
pub use config::{EngineConfig, EstimatePolicy, InvalidationMode};
pub use error::{CacheError, ConfigError, EstimaError, EstimaResult, TransportError, ValidationError};
pub use key::{build_key, StableKey};
pub use request::{AttrValue, PricingRequest, PricingRequestBuilder, ProcessType, RequestField};
pub use response::{
    AnnotatedPricingResponse, CatalogVersion, PriceBreakdown, PricingResponse, Provenance,
    QuantityBreak, QuoteStatus,
};
