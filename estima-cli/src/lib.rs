//! estima Simulator
//!
//! Replays a recorded editing session (JSON lines) through the pricing
//! engine against a deterministic simulated pricing service and reports what
//! the user would have seen.

pub mod config;
pub mod error;
pub mod run;
pub mod script;
pub mod sim;

pub use config::{CliArgs, SimConfig, SimulatorConfig};
pub use error::CliError;
pub use run::{Simulation, StepReport, Summary};
pub use script::{parse_script, ScriptLine, ScriptStep};
pub use sim::SimulatedPricing;
