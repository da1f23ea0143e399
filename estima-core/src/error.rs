//! Error types for estima operations

use thiserror::Error;

/// Malformed pricing request. Raised before any cache or network interaction
/// and never retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::RequiredFieldMissing {
            field: field.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field.
    pub fn field(&self) -> &str {
        match self {
            Self::RequiredFieldMissing { field } | Self::InvalidValue { field, .. } => field,
        }
    }
}

/// Failures of the external pricing function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Network failure: {reason}")]
    Network { reason: String },

    #[error("Pricing service returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Pricing service timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Invalid response from pricing service: {reason}")]
    InvalidResponse { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },

    #[error("Failed to read configuration: {reason}")]
    Io { reason: String },
}

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Master error type for all estima errors.
///
/// Every variant is `Clone` so that a single failed fetch can be delivered to
/// every caller attached to the same in-flight reconciliation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EstimaError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl EstimaError {
    /// Only transport failures are worth another attempt at the fetch layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias for estima operations.
pub type EstimaResult<T> = Result<T, EstimaError>;

// =============================================================================
// TESTS
// =============================================================================
