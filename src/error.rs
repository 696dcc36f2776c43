//! Error types for meshctl
//!
//! The taxonomy follows the node's propagation policy: configuration and
//! render errors surface before any OS mutation, reconcile errors split into
//! recoverable and fatal, and telemetry errors never escape a single
//! sub-query.

use std::io;
use thiserror::Error;

/// Missing or invalid NodeConfig field. User-correctable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required field '{field}'")]
    Missing { field: String },
    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field, when there is one
    pub fn field(&self) -> Option<&str> {
        match self {
            ConfigError::Missing { field } | ConfigError::Invalid { field, .. } => Some(field),
            ConfigError::Parse(_) => None,
        }
    }
}

/// Rendering contract violation. Never silently defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("missing required field '{field}'")]
    MissingField { field: String },
    #[error("unsupported security mode '{value}' for '{field}' (expected open, wpa2, wpa3 or mixed)")]
    UnsupportedMode { field: String, value: String },
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl RenderError {
    pub fn missing(field: &str) -> Self {
        RenderError::MissingField {
            field: field.to_string(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        RenderError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            RenderError::MissingField { field }
            | RenderError::UnsupportedMode { field, .. }
            | RenderError::InvalidValue { field, .. } => field,
        }
    }
}

impl From<RenderError> for ConfigError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::MissingField { field } => ConfigError::Missing { field },
            RenderError::UnsupportedMode { field, value } => ConfigError::Invalid {
                field,
                reason: format!("unsupported security mode '{}'", value),
            },
            RenderError::InvalidValue { field, reason } => ConfigError::Invalid { field, reason },
        }
    }
}

/// OS-level mutation failure during a reconciliation pass
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Rejected before any mutation was attempted
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    /// Failed once; the caller applies its documented workaround and retries
    #[error("{step} failed (recoverable): {reason}")]
    Recoverable { step: String, reason: String },
    /// Aborts the remaining steps of the pass
    #[error("{step} failed: {reason}")]
    Fatal { step: String, reason: String },
}

impl ReconcileError {
    pub fn fatal(step: &str, reason: impl Into<String>) -> Self {
        ReconcileError::Fatal {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn recoverable(step: &str, reason: impl Into<String>) -> Self {
        ReconcileError::Recoverable {
            step: step.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReconcileError::Recoverable { .. })
    }
}

/// Failure of a single telemetry sub-query
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("{source_name} timed out after {millis} ms")]
    Timeout { source_name: String, millis: u64 },
    #[error("{source_name} failed: {reason}")]
    Query { source_name: String, reason: String },
}

/// Crate-wide error
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{}", command_failed_message(.cmd, .code, .stderr))]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Render error: {0}")]
    Render(#[from] RenderError),
    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),
    #[error("Service error: {0}")]
    Service(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}

fn command_failed_message(cmd: &str, code: &Option<i32>, stderr: &str) -> String {
    match code {
        Some(code) => format!("Command '{}' failed with code {}: {}", cmd, code, stderr.trim()),
        None => format!("Command '{}' failed: {}", cmd, stderr.trim()),
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Parse(error.to_string())
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
