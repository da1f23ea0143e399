//! Error types for the simulator.

use estima_core::{ConfigError, EstimaError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("usage: estima-sim [--config <path.toml>] <script.jsonl>")]
    Usage,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("script line {line}: {reason}")]
    Script { line: usize, reason: String },
    #[error(transparent)]
    Engine(#[from] EstimaError),
}
