//! Fetch layer: bounded retries and the slow-fetch warning.

use std::sync::Arc;
use std::time::Duration;

use estima_core::{EngineConfig, EstimaError, PricingRequest, PricingResponse, StableKey};
use tokio::time::Instant;

use crate::notify::PriceNotifier;
use crate::provider::PricingFunction;

/// A successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub response: PricingResponse,
    /// Attempts beyond the first.
    pub retries: u32,
    pub elapsed: Duration,
}

/// A fetch that failed after exhausting its retries.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFailure {
    pub error: EstimaError,
    pub retries: u32,
    pub elapsed: Duration,
}

/// Calls the pricing function with retry and slow-fetch reporting.
#[derive(Clone)]
pub struct Fetcher {
    pricing: Arc<dyn PricingFunction>,
    notifier: Arc<dyn PriceNotifier>,
    retries: u32,
    backoff: Duration,
    slow_after: Duration,
}

impl Fetcher {
    pub fn new(
        pricing: Arc<dyn PricingFunction>,
        notifier: Arc<dyn PriceNotifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            pricing,
            notifier,
            retries: config.fetch_retries,
            backoff: config.retry_backoff(),
            slow_after: config.slow_fetch_warning(),
        }
    }

    /// Fetch the price for `request`.
    ///
    /// Transport errors are retried up to the configured count with doubling
    /// backoff. If the whole fetch is still running after the slow-fetch
    /// threshold the notifier is told once; the fetch is not cancelled.
    pub async fn fetch(
        &self,
        key: &StableKey,
        request: &PricingRequest,
    ) -> Result<Fetched, FetchFailure> {
        let started = Instant::now();
        let work = self.fetch_with_retries(key, request, started);
        tokio::pin!(work);

        let slow = tokio::time::sleep(self.slow_after);
        tokio::pin!(slow);

        tokio::select! {
            biased;
            result = &mut work => result,
            _ = &mut slow => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    key = %key.short(),
                    pricing = self.pricing.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "pricing fetch is slow"
                );
                self.notifier.on_slow_fetch(key, elapsed);
                work.await
            }
        }
    }

    async fn fetch_with_retries(
        &self,
        key: &StableKey,
        request: &PricingRequest,
        started: Instant,
    ) -> Result<Fetched, FetchFailure> {
        let mut attempt: u32 = 0;
        loop {
            match self.pricing.fetch_price(request).await {
                Ok(response) => {
                    return Ok(Fetched {
                        response,
                        retries: attempt,
                        elapsed: started.elapsed(),
                    })
                }
                Err(error) if error.is_retryable() && attempt < self.retries => {
                    let delay = self.backoff.saturating_mul(1u32 << attempt.min(16));
                    tracing::warn!(
                        key = %key.short(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "pricing fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(FetchFailure {
                        error,
                        retries: attempt,
                        elapsed: started.elapsed(),
                    })
                }
            }
        }
    }
}
