//! Pricing responses and their cache annotation.

use crate::request::PricingRequest;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of the pricing model/catalog a price was computed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CatalogVersion(String);

impl CatalogVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CatalogVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CatalogVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CatalogVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether the pricing service produced a firm quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteStatus {
    #[default]
    Quoted,
    /// Manual review required; no usable price yet.
    TbdPending,
}

/// Server-computed cost components. All amounts are for the whole order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceBreakdown {
    /// Fixed cost independent of quantity.
    pub setup: f64,
    pub machining: f64,
    pub material: f64,
    pub finish: f64,
    pub inspection: f64,
    pub overhead: f64,
    pub margin: f64,
}

impl PriceBreakdown {
    pub fn total(&self) -> f64 {
        self.setup
            + self.machining
            + self.material
            + self.finish
            + self.inspection
            + self.overhead
            + self.margin
    }

    /// Everything that scales with quantity.
    pub fn variable(&self) -> f64 {
        self.total() - self.setup
    }

    /// Multiply every component by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            setup: self.setup * factor,
            machining: self.machining * factor,
            material: self.material * factor,
            finish: self.finish * factor,
            inspection: self.inspection * factor,
            overhead: self.overhead * factor,
            margin: self.margin * factor,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0.0
    }
}

/// One row of a quantity-break table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantityBreak {
    pub min_qty: u32,
    /// Inclusive upper bound; `None` means open-ended.
    #[serde(default)]
    pub max_qty: Option<u32>,
    pub unit_price: f64,
    #[serde(default)]
    pub discount_pct: f64,
}

impl QuantityBreak {
    pub fn covers(&self, quantity: u32) -> bool {
        quantity >= self.min_qty && self.max_qty.map_or(true, |max| quantity <= max)
    }
}

/// Authoritative result of the external pricing function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResponse {
    pub total_price: f64,
    pub unit_price: f64,
    pub currency: String,
    /// Provenance id assigned by the pricing service.
    pub pricing_hash: String,
    pub catalog_version: CatalogVersion,
    #[serde(default)]
    pub lead_time_days: u32,
    #[serde(default)]
    pub breakdown: PriceBreakdown,
    #[serde(default)]
    pub quantity_breaks: Vec<QuantityBreak>,
    #[serde(default)]
    pub status: QuoteStatus,
    /// Set when the pricing service answered from its own cache.
    #[serde(default)]
    pub from_cache: bool,
}

impl PricingResponse {
    /// The quantity-break row that applies to `quantity`, if any.
    pub fn break_for(&self, quantity: u32) -> Option<&QuantityBreak> {
        self.quantity_breaks.iter().find(|b| b.covers(quantity))
    }

    pub fn is_quoted(&self) -> bool {
        self.status == QuoteStatus::Quoted
    }
}

/// Where a cached price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Returned by the pricing function.
    Server,
    /// Extrapolated locally from a previous server price.
    Optimistic,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Server => f.write_str("server"),
            Provenance::Optimistic => f.write_str("optimistic"),
        }
    }
}

/// A price as stored in and read from the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedPricingResponse {
    pub response: PricingResponse,
    /// The request this price answers.
    pub request: PricingRequest,
    pub provenance: Provenance,
    /// Estimate confidence in `[0, 1]`; `None` for server prices.
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl AnnotatedPricingResponse {
    pub fn server(response: PricingResponse, request: PricingRequest) -> Self {
        Self {
            response,
            request,
            provenance: Provenance::Server,
            confidence: None,
        }
    }

    pub fn optimistic(response: PricingResponse, request: PricingRequest, confidence: f64) -> Self {
        Self {
            response,
            request,
            provenance: Provenance::Optimistic,
            confidence: Some(confidence.clamp(0.0, 1.0)),
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.provenance == Provenance::Optimistic
    }

    pub fn total_price(&self) -> f64 {
        self.response.total_price
    }

    pub fn catalog_version(&self) -> &CatalogVersion {
        &self.response.catalog_version
    }
}
