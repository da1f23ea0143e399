//! Deterministic stand-in for the pricing service.
//!
//! Total = setup + quantity × discounted unit cost, where the unit cost
//! depends on process, finishes and tolerance and the discount comes from a
//! fixed quantity-break table. Quotes are remembered per key so a repeated
//! request is answered "from cache", like the real service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use estima_core::{
    build_key, CatalogVersion, EstimaResult, PriceBreakdown, PricingRequest, PricingResponse,
    ProcessType, QuantityBreak, QuoteStatus,
};
use estima_engine::PricingFunction;

use crate::config::SimulatorConfig;

/// `(min_qty, max_qty, discount)` tiers.
const TIERS: [(u32, Option<u32>, f64); 4] = [
    (1, Some(9), 0.0),
    (10, Some(49), 0.10),
    (50, Some(199), 0.20),
    (200, None, 0.30),
];

const MATERIAL_SHARE: f64 = 0.35;
const TOLERANCE_FACTOR: f64 = 1.15;

fn process_factor(process: ProcessType) -> f64 {
    match process {
        ProcessType::CncMilling => 1.0,
        ProcessType::CncTurning => 0.8,
        ProcessType::SheetMetal => 0.6,
        ProcessType::InjectionMolding => 0.25,
    }
}

fn tier_discount(quantity: u32) -> f64 {
    TIERS
        .iter()
        .find(|(min, max, _)| quantity >= *min && max.map_or(true, |max| quantity <= max))
        .map_or(0.0, |(_, _, discount)| *discount)
}

#[derive(Debug)]
pub struct SimulatedPricing {
    config: SimulatorConfig,
    catalog_version: Mutex<CatalogVersion>,
    quoted: Mutex<HashSet<String>>,
    calls: AtomicU64,
}

impl SimulatedPricing {
    pub fn new(config: SimulatorConfig) -> Self {
        let catalog_version = CatalogVersion::new(config.catalog_version.clone());
        Self {
            config,
            catalog_version: Mutex::new(catalog_version),
            quoted: Mutex::new(HashSet::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Switch the catalog; previously quoted keys are forgotten.
    pub fn set_catalog_version(&self, version: impl Into<CatalogVersion>) {
        *self
            .catalog_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = version.into();
        self.quoted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    fn unit_cost(&self, request: &PricingRequest) -> f64 {
        let mut unit = self.config.unit_cost * process_factor(request.process);
        unit += self.config.finish_cost * request.sorted_finishes().len() as f64;
        if request.tolerance_id.is_some() {
            unit *= TOLERANCE_FACTOR;
        }
        unit
    }

    /// Price `request` without latency or bookkeeping.
    pub fn quote(&self, request: &PricingRequest) -> PricingResponse {
        let quantity = f64::from(request.quantity);
        let unit = self.unit_cost(request);
        let rush = if request.is_rush {
            self.config.rush_multiplier
        } else {
            1.0
        };

        let variable = quantity * unit * (1.0 - tier_discount(request.quantity));
        let setup = self.config.setup_cost;
        let finish = quantity * self.config.finish_cost * request.sorted_finishes().len() as f64;
        let material = variable * MATERIAL_SHARE;
        let breakdown = PriceBreakdown {
            setup: setup * rush,
            machining: (variable - material - finish).max(0.0) * rush,
            material: material * rush,
            finish: finish * rush,
            ..PriceBreakdown::default()
        };
        let total = (setup + variable) * rush;

        let quantity_breaks = TIERS
            .iter()
            .map(|(min_qty, max_qty, discount)| QuantityBreak {
                min_qty: *min_qty,
                max_qty: *max_qty,
                unit_price: unit * (1.0 - discount),
                discount_pct: discount * 100.0,
            })
            .collect();

        PricingResponse {
            total_price: total,
            unit_price: total / quantity,
            currency: self.config.currency.clone(),
            pricing_hash: String::new(),
            catalog_version: self
                .catalog_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            lead_time_days: if request.is_rush { 3 } else { 10 },
            breakdown,
            quantity_breaks,
            status: QuoteStatus::Quoted,
            from_cache: false,
        }
    }
}

#[async_trait]
impl PricingFunction for SimulatedPricing {
    async fn fetch_price(&self, request: &PricingRequest) -> EstimaResult<PricingResponse> {
        let key = build_key(request)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        let mut response = self.quote(request);
        response.pricing_hash = format!("sim_{}", key.short());
        response.from_cache = !self
            .quoted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.digest());
        Ok(response)
    }

    fn name(&self) -> &str {
        "simulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(quantity: u32) -> PricingRequest {
        PricingRequest::builder()
            .part_id("bracket")
            .process(ProcessType::CncMilling)
            .material_id("al-6061")
            .machine_id("haas")
            .quantity(quantity)
            .build()
            .unwrap()
    }

    fn sim() -> SimulatedPricing {
        SimulatedPricing::new(SimulatorConfig {
            latency_ms: 0,
            ..SimulatorConfig::default()
        })
    }

    #[test]
    fn test_quote_rolls_up_setup_and_tiers() {
        let sim = sim();
        assert!((sim.quote(&request(1)).total_price - 190.0).abs() < 1e-9);
        assert!((sim.quote(&request(10)).total_price - 510.0).abs() < 1e-9);
        let quote = sim.quote(&request(10));
        assert!((quote.breakdown.total() - quote.total_price).abs() < 1e-9);
        assert_eq!(quote.break_for(75).map(|b| b.min_qty), Some(50));
    }

    #[test]
    fn test_rush_scales_total() {
        let sim = sim();
        let mut rush = request(10);
        rush.is_rush = true;
        let ratio = sim.quote(&rush).total_price / sim.quote(&request(10)).total_price;
        assert!((ratio - 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_repeat_answered_from_cache_until_catalog_changes() {
        let sim = sim();
        assert!(!sim.fetch_price(&request(5)).await.unwrap().from_cache);
        assert!(sim.fetch_price(&request(5)).await.unwrap().from_cache);

        sim.set_catalog_version("v2");
        let fresh = sim.fetch_price(&request(5)).await.unwrap();
        assert!(!fresh.from_cache);
        assert_eq!(fresh.catalog_version, CatalogVersion::new("v2"));
        assert_eq!(sim.calls(), 3);
    }
}
