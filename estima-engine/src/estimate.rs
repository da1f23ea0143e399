//! Optimistic price extrapolation.
//!
//! Given the last known price and the request the user just produced, guess
//! the new price without asking the pricing service. The guess is pure
//! computation; writing it anywhere is the reconciler's business.

use estima_core::{
    AnnotatedPricingResponse, EstimatePolicy, PricingRequest, PricingResponse, RequestField,
};

/// An extrapolated price and how much to trust it.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub response: PricingResponse,
    /// In `[0, 1]`.
    pub confidence: f64,
    /// Fields that differ from the baseline request.
    pub changed: Vec<RequestField>,
}

/// Produces [`Estimate`]s according to an [`EstimatePolicy`].
#[derive(Debug, Clone, Default)]
pub struct EstimateEngine {
    policy: EstimatePolicy,
}

impl EstimateEngine {
    pub fn new(policy: EstimatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EstimatePolicy {
        &self.policy
    }

    /// Estimate the price of `next` from `baseline`.
    ///
    /// Returns `None` when there is no baseline, when the baseline is not a
    /// firm quote, when a model-breaking field (part, process, material,
    /// machine) changed, or when confidence falls below the policy minimum.
    pub fn estimate(
        &self,
        baseline: Option<&AnnotatedPricingResponse>,
        next: &PricingRequest,
    ) -> Option<Estimate> {
        let baseline = baseline?;
        if !baseline.response.is_quoted() {
            return None;
        }

        let changed = baseline.request.diff(next);
        if changed.iter().any(RequestField::is_model_breaking) {
            return None;
        }

        let policy = &self.policy;
        let mut confidence = baseline.confidence.unwrap_or(1.0);
        let mut response = baseline.response.clone();
        response.from_cache = false;

        if changed.is_empty() {
            return Some(Estimate {
                response,
                confidence,
                changed,
            });
        }

        let mut priced_from_break = false;

        if changed.contains(&RequestField::Quantity) {
            let old_qty = f64::from(baseline.request.quantity);
            let new_qty = f64::from(next.quantity);
            let ratio = new_qty / old_qty;
            let doublings = ratio.log2();

            // depends only on the size of the jump, never on which path priced it
            confidence *= policy.quantity_confidence
                * (1.0 - policy.quantity_decay_per_doubling).powf(doublings.abs());

            if let Some(row) = baseline.response.break_for(next.quantity) {
                // break tables list standard (non-rush) prices
                let mut total = row.unit_price * new_qty;
                if next.is_rush {
                    total *= policy.rush_multiplier;
                }
                rescale_total(&mut response, total);
                priced_from_break = true;
            } else {
                let curve = (1.0 - policy.discount_per_doubling).powf(doublings);

                let total = response.total_price;
                let setup = response.breakdown.setup.clamp(0.0, total.max(0.0));
                let variable = total - setup;
                let new_variable = variable * ratio * curve;

                if variable > 0.0 && !response.breakdown.is_empty() {
                    let setup_cost = response.breakdown.setup;
                    response.breakdown = response.breakdown.scaled(new_variable / variable);
                    response.breakdown.setup = setup_cost;
                }
                response.total_price = setup + new_variable;
            }
        }

        if changed.contains(&RequestField::Rush) {
            if !priced_from_break {
                let factor = if next.is_rush {
                    policy.rush_multiplier
                } else {
                    1.0 / policy.rush_multiplier
                };
                let total = response.total_price * factor;
                rescale_total(&mut response, total);
            }
            confidence *= policy.rush_confidence;
        }

        let soft_changes = changed
            .iter()
            .filter(|field| {
                matches!(
                    field,
                    RequestField::Finishes
                        | RequestField::Tolerance
                        | RequestField::LeadTime
                        | RequestField::Attribute(_)
                )
            })
            .count();
        confidence *= policy.soft_field_confidence.powi(soft_changes as i32);
        confidence *= policy
            .extra_change_factor
            .powi(changed.len().saturating_sub(1) as i32);

        let confidence = confidence.clamp(0.0, 1.0);
        if confidence < policy.min_confidence {
            tracing::debug!(
                confidence,
                min_confidence = policy.min_confidence,
                changed = changed.len(),
                "estimate withheld"
            );
            return None;
        }

        response.unit_price = response.total_price / f64::from(next.quantity);

        Some(Estimate {
            response,
            confidence,
            changed,
        })
    }
}

/// Set a new total and scale the breakdown proportionally.
fn rescale_total(response: &mut PricingResponse, total: f64) {
    let old = response.total_price;
    if old > 0.0 && !response.breakdown.is_empty() {
        response.breakdown = response.breakdown.scaled(total / old);
    }
    response.total_price = total;
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use estima_core::{AttrValue, CatalogVersion, ProcessType, QuantityBreak};
    use proptest::prelude::*;

    fn base_request() -> PricingRequest {
        PricingRequest::builder()
            .part_id("p")
            .process(ProcessType::SheetMetal)
            .material_id("steel")
            .machine_id("laser")
            .quantity(100)
            .build()
            .unwrap()
    }

    fn base() -> AnnotatedPricingResponse {
        AnnotatedPricingResponse::server(
            PricingResponse {
                total_price: 1_000.0,
                unit_price: 10.0,
                currency: "USD".to_string(),
                pricing_hash: "ph".to_string(),
                catalog_version: CatalogVersion::new("v1"),
                lead_time_days: 5,
                breakdown: Default::default(),
                quantity_breaks: vec![],
                status: Default::default(),
                from_cache: false,
            },
            base_request(),
        )
    }

    /// Apply the first `n` of a fixed list of soft edits.
    fn with_edits(n: usize, quantity: u32) -> PricingRequest {
        let mut r = base_request();
        r.quantity = quantity;
        if n > 0 {
            r.finish_ids = vec!["powder-coat".to_string()];
        }
        if n > 1 {
            r.tolerance_id = Some("tight".to_string());
        }
        if n > 2 {
            r.lead_time_id = Some("expedite".to_string());
        }
        if n > 3 {
            r.attributes.insert("bends".to_string(), AttrValue::Number(6.0));
        }
        r
    }

    /// Baseline whose break table covers quantities from `break_from` up.
    fn base_with_breaks(break_from: u32) -> AnnotatedPricingResponse {
        let mut base = base();
        base.response.quantity_breaks = vec![
            QuantityBreak {
                min_qty: 1,
                max_qty: Some(break_from.saturating_sub(1).max(1)),
                unit_price: 10.0,
                discount_pct: 0.0,
            },
            QuantityBreak {
                min_qty: break_from,
                max_qty: None,
                unit_price: 7.0,
                discount_pct: 30.0,
            },
        ];
        base
    }

    fn confidence_from(baseline: &AnnotatedPricingResponse, request: &PricingRequest) -> f64 {
        let engine = EstimateEngine::new(EstimatePolicy {
            min_confidence: 0.0,
            ..EstimatePolicy::default()
        });
        engine
            .estimate(Some(baseline), request)
            .map(|e| e.confidence)
            .unwrap_or(0.0)
    }

    fn confidence(request: &PricingRequest) -> f64 {
        confidence_from(&base(), request)
    }

    proptest! {
        /// Property: confidence always lies in [0, 1].
        #[test]
        fn prop_confidence_in_unit_interval(n in 0usize..5, qty in 1u32..100_000) {
            let c = confidence(&with_edits(n, qty));
            prop_assert!((0.0..=1.0).contains(&c));
        }

        /// Property: one more changed field never raises confidence.
        #[test]
        fn prop_fewer_changes_never_less_confident(n in 0usize..4, qty in 1u32..10_000) {
            prop_assert!(confidence(&with_edits(n, qty)) >= confidence(&with_edits(n + 1, qty)));
        }

        /// Property: a smaller quantity jump never lowers confidence.
        #[test]
        fn prop_smaller_quantity_delta_never_less_confident(a in 101u32..10_000, b in 101u32..10_000) {
            let (near, far) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(confidence(&with_edits(0, near)) >= confidence(&with_edits(0, far)));
        }

        /// Property: the same holds when a break table prices some of the quantities.
        #[test]
        fn prop_smaller_quantity_delta_never_less_confident_with_breaks(
            a in 101u32..10_000,
            b in 101u32..10_000,
            break_from in 2u32..10_000,
        ) {
            let baseline = base_with_breaks(break_from);
            let (near, far) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(
                confidence_from(&baseline, &with_edits(0, near))
                    >= confidence_from(&baseline, &with_edits(0, far))
            );
        }

        /// Property: quantity estimates stay positive and grow with quantity.
        #[test]
        fn prop_total_grows_with_quantity(a in 1u32..10_000, b in 1u32..10_000) {
            let engine = EstimateEngine::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo_total = engine.estimate(Some(&base()), &with_edits(0, lo)).map(|e| e.response.total_price);
            let hi_total = engine.estimate(Some(&base()), &with_edits(0, hi)).map(|e| e.response.total_price);
            if let (Some(lo_total), Some(hi_total)) = (lo_total, hi_total) {
                prop_assert!(lo_total > 0.0);
                prop_assert!(hi_total >= lo_total);
            }
        }
    }
}
