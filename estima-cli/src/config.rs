//! Simulator configuration.
//!
//! Loaded from the TOML file named by `--config` (or `ESTIMA_SIM_CONFIG`).
//! Without a file the engine settings come from `ESTIMA_*` environment
//! variables and the simulated service uses its defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use estima_core::{ConfigError, EngineConfig};
use serde::{Deserialize, Serialize};

/// Behavior of the simulated pricing service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// One-off setup cost added to every quote.
    pub setup_cost: f64,
    /// Base variable cost per part before process and finish adjustments.
    pub unit_cost: f64,
    /// Per-part cost of each finish.
    pub finish_cost: f64,
    pub rush_multiplier: f64,
    pub latency_ms: u64,
    pub currency: String,
    pub catalog_version: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            setup_cost: 150.0,
            unit_cost: 40.0,
            finish_cost: 4.0,
            rush_multiplier: 1.25,
            latency_ms: 120,
            currency: "USD".to_string(),
            catalog_version: "v1".to_string(),
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("simulator.setup_cost", self.setup_cost),
            ("simulator.unit_cost", self.unit_cost),
            ("simulator.finish_cost", self.finish_cost),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be a non-negative number".to_string(),
                });
            }
        }
        if !(self.rush_multiplier.is_finite() && self.rush_multiplier >= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "simulator.rush_multiplier".to_string(),
                value: self.rush_multiplier.to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.catalog_version.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "simulator.catalog_version".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub engine: EngineConfig,
    pub simulator: SimulatorConfig,
}

impl SimConfig {
    /// Load from `path`, or from the environment when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self {
                engine: EngineConfig::from_env(),
                simulator: SimulatorConfig::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.simulator.validate()
    }
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub script: PathBuf,
}

impl CliArgs {
    /// Parse `[--config <path>] <script>`; `None` on anything else.
    pub fn parse<I>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut config = None;
        let mut script = None;
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            if arg == "--config" {
                config = Some(PathBuf::from(args.next()?));
            } else if script.is_none() && !arg.starts_with("--") {
                script = Some(PathBuf::from(arg));
            } else {
                return None;
            }
        }

        Some(Self {
            config: config.or_else(|| env::var("ESTIMA_SIM_CONFIG").ok().map(PathBuf::from)),
            script: script?,
        })
    }
}
