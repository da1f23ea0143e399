//! The external pricing function.

use async_trait::async_trait;
use estima_core::{EstimaResult, PricingRequest, PricingResponse};
use std::sync::Arc;

/// Authoritative source of prices.
///
/// Implementations must be idempotent: pricing the same request twice has no
/// side effects beyond the returned value. Failures should be reported as
/// [`TransportError`](estima_core::TransportError) (retried by the engine)
/// or [`ValidationError`](estima_core::ValidationError) (never retried).
///
/// # Example
/// ```ignore
/// struct HttpPricing { client: Client, base_url: String }
///
/// #[async_trait]
/// impl PricingFunction for HttpPricing {
///     async fn fetch_price(&self, request: &PricingRequest) -> EstimaResult<PricingResponse> {
///         // POST {base_url}/price
///     }
/// }
/// ```
#[async_trait]
pub trait PricingFunction: Send + Sync {
    async fn fetch_price(&self, request: &PricingRequest) -> EstimaResult<PricingResponse>;

    /// Identifier used in log lines.
    fn name(&self) -> &str {
        "pricing"
    }
}

#[async_trait]
impl<P: PricingFunction + ?Sized> PricingFunction for Arc<P> {
    async fn fetch_price(&self, request: &PricingRequest) -> EstimaResult<PricingResponse> {
        (**self).fetch_price(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
