//! Engine configuration.
//!
//! Every knob has a documented default. Configuration can come from the
//! environment (`ESTIMA_*` variables), a TOML document, or be assembled in
//! code with the `with_*` setters.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What an invalidation sweep does with entries from another catalog version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Remove the entry; its value survives only as a placeholder.
    #[default]
    Evict,
    /// Keep the entry but make it stale so the next read refetches.
    MarkStale,
}

impl FromStr for InvalidationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict" => Ok(Self::Evict),
            "mark_stale" | "mark-stale" => Ok(Self::MarkStale),
            other => Err(ConfigError::InvalidValue {
                field: "invalidation_mode".to_string(),
                value: other.to_string(),
                reason: "expected evict or mark_stale".to_string(),
            }),
        }
    }
}

impl fmt::Display for InvalidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evict => f.write_str("evict"),
            Self::MarkStale => f.write_str("mark_stale"),
        }
    }
}

/// Heuristics for optimistic estimates.
///
/// Confidence is the product of one factor per changed field, times
/// `extra_change_factor` for every changed field beyond the first. All
/// factors are at most 1, so fewer and smaller changes never lower it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatePolicy {
    /// Unit-price discount per doubling of quantity on the variable cost.
    pub discount_per_doubling: f64,
    /// Price multiplier applied when rush is switched on.
    pub rush_multiplier: f64,
    /// Estimates below this confidence are withheld.
    pub min_confidence: f64,
    /// Any quantity change, whether priced from a break row or the curve.
    pub quantity_confidence: f64,
    /// Further decay per doubling (or halving) of quantity.
    pub quantity_decay_per_doubling: f64,
    pub rush_confidence: f64,
    /// Finish set, tolerance, lead time or a free-form attribute changed.
    pub soft_field_confidence: f64,
    pub extra_change_factor: f64,
}

impl Default for EstimatePolicy {
    fn default() -> Self {
        Self {
            discount_per_doubling: 0.05,
            rush_multiplier: 1.25,
            min_confidence: 0.10,
            quantity_confidence: 0.85,
            quantity_decay_per_doubling: 0.08,
            rush_confidence: 0.9,
            soft_field_confidence: 0.6,
            extra_change_factor: 0.9,
        }
    }
}

impl EstimatePolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.discount_per_doubling) {
            return Err(invalid(
                "estimate.discount_per_doubling",
                self.discount_per_doubling,
                "must be within [0, 1)",
            ));
        }
        if !(self.rush_multiplier.is_finite() && self.rush_multiplier > 0.0) {
            return Err(invalid(
                "estimate.rush_multiplier",
                self.rush_multiplier,
                "must be positive",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(invalid(
                "estimate.min_confidence",
                self.min_confidence,
                "must be within [0, 1]",
            ));
        }
        if !(0.0..1.0).contains(&self.quantity_decay_per_doubling) {
            return Err(invalid(
                "estimate.quantity_decay_per_doubling",
                self.quantity_decay_per_doubling,
                "must be within [0, 1)",
            ));
        }
        for (field, value) in [
            ("estimate.quantity_confidence", self.quantity_confidence),
            ("estimate.rush_confidence", self.rush_confidence),
            ("estimate.soft_field_confidence", self.soft_field_confidence),
            ("estimate.extra_change_factor", self.extra_change_factor),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, value, "must be within (0, 1]"));
            }
        }
        Ok(())
    }
}

/// Configuration for the pricing engine and its cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a written entry is served without refetching.
    pub stale_time_ms: u64,
    /// Entries untouched for this long are dropped.
    pub gc_time_ms: u64,
    /// Relative deviation above which an optimistic price is rolled back.
    pub rollback_threshold: f64,
    /// Notify the caller when a fetch is still running after this long.
    pub slow_fetch_warning_ms: u64,
    /// Additional attempts after a transport failure.
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub gc_sweep_interval_ms: u64,
    pub cache_shards: usize,
    /// Capacity of recording and channel telemetry sinks.
    pub telemetry_buffer: usize,
    pub invalidation_mode: InvalidationMode,
    pub estimate: EstimatePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: 60_000,
            gc_time_ms: 600_000,
            rollback_threshold: 0.10,
            slow_fetch_warning_ms: 3_000,
            fetch_retries: 1,
            retry_backoff_ms: 200,
            gc_sweep_interval_ms: 30_000,
            cache_shards: 16,
            telemetry_buffer: 1_000,
            invalidation_mode: InvalidationMode::Evict,
            estimate: EstimatePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `ESTIMA_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load using an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |name: &str| lookup(name).map(|v| v.trim().to_string());

        Self {
            stale_time_ms: parse("ESTIMA_STALE_TIME_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.stale_time_ms),
            gc_time_ms: parse("ESTIMA_GC_TIME_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.gc_time_ms),
            rollback_threshold: parse("ESTIMA_ROLLBACK_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.rollback_threshold),
            slow_fetch_warning_ms: parse("ESTIMA_SLOW_FETCH_WARNING_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.slow_fetch_warning_ms),
            fetch_retries: parse("ESTIMA_FETCH_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.fetch_retries),
            retry_backoff_ms: parse("ESTIMA_RETRY_BACKOFF_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_backoff_ms),
            gc_sweep_interval_ms: parse("ESTIMA_GC_SWEEP_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.gc_sweep_interval_ms),
            cache_shards: parse("ESTIMA_CACHE_SHARDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_shards),
            telemetry_buffer: parse("ESTIMA_TELEMETRY_BUFFER")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.telemetry_buffer),
            invalidation_mode: parse("ESTIMA_INVALIDATION_MODE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.invalidation_mode),
            estimate: defaults.estimate,
        }
    }

    /// Parse and validate a TOML document. Missing keys take defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stale_time_ms == 0 {
            return Err(invalid("stale_time_ms", 0, "must be greater than zero"));
        }
        if self.gc_time_ms < self.stale_time_ms {
            return Err(invalid(
                "gc_time_ms",
                self.gc_time_ms,
                format!("must be at least stale_time_ms ({})", self.stale_time_ms),
            ));
        }
        if !(self.rollback_threshold > 0.0 && self.rollback_threshold <= 1.0) {
            return Err(invalid(
                "rollback_threshold",
                self.rollback_threshold,
                "must be within (0, 1]",
            ));
        }
        if self.cache_shards == 0 {
            return Err(invalid("cache_shards", 0, "must be greater than zero"));
        }
        if self.telemetry_buffer == 0 {
            return Err(invalid("telemetry_buffer", 0, "must be greater than zero"));
        }
        if self.gc_sweep_interval_ms == 0 {
            return Err(invalid("gc_sweep_interval_ms", 0, "must be greater than zero"));
        }
        self.estimate.validate()
    }

    pub fn with_stale_time_ms(mut self, ms: u64) -> Self {
        self.stale_time_ms = ms;
        self
    }

    pub fn with_gc_time_ms(mut self, ms: u64) -> Self {
        self.gc_time_ms = ms;
        self
    }

    pub fn with_rollback_threshold(mut self, threshold: f64) -> Self {
        self.rollback_threshold = threshold;
        self
    }

    pub fn with_slow_fetch_warning_ms(mut self, ms: u64) -> Self {
        self.slow_fetch_warning_ms = ms;
        self
    }

    pub fn with_fetch_retries(mut self, retries: u32) -> Self {
        self.fetch_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.retry_backoff_ms = ms;
        self
    }

    pub fn with_gc_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.gc_sweep_interval_ms = ms;
        self
    }

    pub fn with_cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    pub fn with_telemetry_buffer(mut self, capacity: usize) -> Self {
        self.telemetry_buffer = capacity;
        self
    }

    pub fn with_invalidation_mode(mut self, mode: InvalidationMode) -> Self {
        self.invalidation_mode = mode;
        self
    }

    pub fn with_estimate_policy(mut self, policy: EstimatePolicy) -> Self {
        self.estimate = policy;
        self
    }

    pub fn slow_fetch_warning(&self) -> Duration {
        Duration::from_millis(self.slow_fetch_warning_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn gc_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.gc_sweep_interval_ms)
    }
}

fn invalid(field: &str, value: impl fmt::Display, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

// =============================================================================
// TESTS
// =============================================================================
