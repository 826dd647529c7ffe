//! Error types for segrun.
//!
//! Uses `thiserror` for public API error types. Each stage of a run has its
//! own enum; `SegrunError` wraps them so callers can propagate with `?`.

use std::path::PathBuf;

/// Top-level error type for the segrun core library.
#[derive(Debug, thiserror::Error)]
pub enum SegrunError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Training runtime failure: {0}")]
    Runtime(#[from] RuntimeFailure),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SegrunError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Malformed or unknown configuration fields.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown field: {field}")]
    UnknownField { field: String },

    #[error("Ambiguous field '{field}', qualify it with one of: {}", candidates.join(", "))]
    AmbiguousField {
        field: String,
        candidates: Vec<String>,
    },

    #[error("Type mismatch for '{field}': expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("Malformed override '{raw}', expected key=value")]
    MalformedOverride { raw: String },

    #[error("Configuration source error: {message}")]
    Source { message: String },
}

/// Configuration that is well-formed but cannot be derived.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no architecture family for {architecture}")]
    NoArchitectureFamily { architecture: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Field '{field}' is fixed once the configuration is composed")]
    FrozenField { field: String },

    #[error("Strategy '{strategy}' requires the {expected} family, configuration has {found}")]
    FamilyMismatch {
        strategy: String,
        expected: String,
        found: String,
    },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },
}

/// Errors from strategy registration and lookup.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StrategyError {
    #[error("Unknown {kind} '{name}', valid names: [{}]", valid.join(", "))]
    Unknown {
        kind: crate::registry::StrategyKind,
        name: String,
        valid: Vec<String>,
    },

    #[error("{kind} '{name}' is already registered")]
    AlreadyRegistered {
        kind: crate::registry::StrategyKind,
        name: String,
    },
}

/// Errors from the run orchestrator itself.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AgentError {
    #[error("Cannot move agent from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

/// Fatal reports from the training runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeFailure {
    #[error("Failed to start trainer: {message}")]
    Spawn { message: String },

    #[error("Trainer reported failure: {message}")]
    Reported { message: String },

    #[error("Trainer exited with {status}")]
    Exited { status: String },

    #[error("Trainer protocol error: {message}")]
    Protocol { message: String },

    #[error("Trainer timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Callback '{callback}' failed: {source}")]
    Callback {
        callback: String,
        #[source]
        source: Box<SegrunError>,
    },

    #[error("Trainer IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeFailure {
    pub fn reported(msg: impl Into<String>) -> Self {
        Self::Reported {
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol {
            message: msg.into(),
        }
    }
}

/// Errors from the tracking service.
#[derive(Debug, thiserror::Error)]
pub enum TrackingError {
    #[error("Tracking run is already finished")]
    Finished,

    #[error("Failed to write tracking data: {message}")]
    Write { message: String },

    #[error("Invalid remote overrides: {message}")]
    InvalidOverrides { message: String },
}

/// Convenience type alias for segrun results.
pub type Result<T> = std::result::Result<T, SegrunError>;
