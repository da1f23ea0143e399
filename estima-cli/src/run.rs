//! Replays a script through one `PriceSession`.

use std::fmt;
use std::sync::Arc;

use estima_cache::CacheStats;
use estima_core::{EstimaError, Provenance};
use estima_engine::{FanoutSink, PricingEngine, ReconcileOutcome, RecordingSink, TracingSink};

use crate::config::SimConfig;
use crate::script::{ScriptLine, ScriptStep};
use crate::sim::SimulatedPricing;

/// What one script line did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    Priced {
        line: usize,
        prefetch: bool,
        key: String,
        /// Optimistic price shown before the server answered.
        optimistic_total: Option<f64>,
        total: f64,
        rolled_back: bool,
        from_memory: bool,
    },
    Invalidated {
        line: usize,
        version: String,
        affected: usize,
    },
    Failed {
        line: usize,
        error: EstimaError,
    },
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepReport::Priced {
                line,
                prefetch,
                key,
                optimistic_total,
                total,
                rolled_back,
                from_memory,
            } => {
                let verb = if *prefetch { "prefetch" } else { "price" };
                write!(f, "{line:>4} {verb:<8} {key} total={total:.2}")?;
                if let Some(optimistic) = optimistic_total {
                    write!(f, " optimistic={optimistic:.2}")?;
                }
                if *rolled_back {
                    f.write_str(" ROLLBACK")?;
                }
                if *from_memory {
                    f.write_str(" (memory)")?;
                }
                Ok(())
            }
            StepReport::Invalidated {
                line,
                version,
                affected,
            } => write!(f, "{line:>4} catalog  {version} invalidated={affected}"),
            StepReport::Failed { line, error } => write!(f, "{line:>4} failed   {error}"),
        }
    }
}

/// Totals after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub steps: usize,
    pub fetches: u64,
    pub failures: usize,
    pub cache_hit_rate: f64,
    pub rollback_rate: f64,
    pub optimistic_applied: usize,
    pub rollbacks: usize,
    pub cache: CacheStats,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "steps:              {}", self.steps)?;
        writeln!(f, "pricing fetches:    {}", self.fetches)?;
        writeln!(f, "failures:           {}", self.failures)?;
        writeln!(f, "cache hit rate:     {:.1}%", self.cache_hit_rate * 100.0)?;
        writeln!(f, "optimistic applied: {}", self.optimistic_applied)?;
        writeln!(f, "rollbacks:          {}", self.rollbacks)?;
        write!(f, "rollback rate:      {:.1}%", self.rollback_rate * 100.0)
    }
}

pub struct Simulation {
    engine: PricingEngine,
    pricing: Arc<SimulatedPricing>,
    recorder: Arc<RecordingSink>,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self, EstimaError> {
        let pricing = Arc::new(SimulatedPricing::new(config.simulator));
        let recorder = Arc::new(RecordingSink::new(config.engine.telemetry_buffer));
        let telemetry = FanoutSink::new()
            .with(recorder.clone())
            .with(Arc::new(TracingSink));

        let engine = PricingEngine::builder(pricing.clone())
            .config(config.engine)
            .telemetry(Arc::new(telemetry))
            .build()?;

        Ok(Self {
            engine,
            pricing,
            recorder,
        })
    }

    pub fn engine(&self) -> &PricingEngine {
        &self.engine
    }

    /// Run every line in order through the engine's default session.
    pub async fn run(&self, script: &[ScriptLine]) -> Vec<StepReport> {
        let mut reports = Vec::with_capacity(script.len());
        for ScriptLine { line, step } in script {
            let report = match step {
                ScriptStep::Catalog { catalog_version } => {
                    self.pricing.set_catalog_version(catalog_version.as_str());
                    match self.engine.on_catalog_version_change(catalog_version.as_str()) {
                        Ok(report) => StepReport::Invalidated {
                            line: *line,
                            version: catalog_version.clone(),
                            affected: report.affected,
                        },
                        Err(error) => StepReport::Failed { line: *line, error },
                    }
                }
                ScriptStep::Prefetch { prefetch } => {
                    let result = self.engine.prefetch(prefetch).await;
                    Self::priced(*line, true, None, result)
                }
                ScriptStep::Edit(request) => {
                    let result = self.engine.update_price(request).await;
                    let optimistic_total = result
                        .as_ref()
                        .ok()
                        .and_then(|outcome| outcome.optimistic_total);
                    Self::priced(*line, false, optimistic_total, result)
                }
            };
            tracing::debug!(report = %report, "step finished");
            reports.push(report);
        }
        reports
    }

    fn priced(
        line: usize,
        prefetch: bool,
        optimistic_total: Option<f64>,
        result: Result<ReconcileOutcome, EstimaError>,
    ) -> StepReport {
        match result {
            Ok(outcome) => StepReport::Priced {
                line,
                prefetch,
                key: outcome.key.short().to_string(),
                optimistic_total,
                total: outcome.response.total_price,
                rolled_back: outcome.rolled_back,
                from_memory: outcome.from_memory,
            },
            Err(error) => StepReport::Failed { line, error },
        }
    }

    pub fn summary(&self, reports: &[StepReport]) -> Summary {
        Summary {
            steps: reports.len(),
            fetches: self.pricing.calls(),
            failures: reports
                .iter()
                .filter(|r| matches!(r, StepReport::Failed { .. }))
                .count(),
            cache_hit_rate: self.recorder.cache_hit_rate(None),
            rollback_rate: self.recorder.rollback_rate(None),
            optimistic_applied: self.recorder.count("optimistic_update_applied"),
            rollbacks: self.recorder.count("optimistic_update_rollback"),
            cache: self.engine.cache_stats(),
        }
    }

    /// Provenance of what the session currently shows.
    pub fn displayed(&self) -> Option<(Provenance, f64)> {
        self.engine
            .default_session()
            .current_price()
            .map(|price| (price.provenance, price.total_price()))
    }
}
