//! Error types for tdecheck.
//!
//! Uses thiserror for closed error enumerations. Callers match on the variant,
//! never on message text:
//! - `GatewayError` is what the external deployment can answer with
//! - `StageError` is why a pipeline stage failed
//! - `ConfigError` covers loading and validating `tdecheck.toml`

use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// MongoDB server error code for an uninitialized replica set.
pub const NOT_YET_INITIALIZED_CODE: i32 = 94;

/// Top-level error type for tdecheck.
#[derive(Error, Debug)]
pub enum TdeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a command gateway.
///
/// The three categories are the only distinctions callers act on.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayError {
    #[error("resource not yet initialized: {message}")]
    NotYetInitialized { message: String },

    #[error("command rejected ({code_name}, code {code}): {message}")]
    Rejected {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl GatewayError {
    /// Shorthand for a `NotYetInitialized` error.
    pub fn not_yet_initialized(message: impl Into<String>) -> Self {
        GatewayError::NotYetInitialized {
            message: message.into(),
        }
    }

    /// Shorthand for a `Rejected` error.
    pub fn rejected(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Rejected {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a `Transport` error.
    pub fn transport(message: impl Into<String>) -> Self {
        GatewayError::Transport {
            message: message.into(),
        }
    }
}

/// Why a stage failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StageError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("resource is not initialized and no bootstrap command is configured")]
    NotInitialized,

    #[error("bootstrap failed: {0}")]
    BootstrapFailed(String),

    #[error("command rejected ({code_name}, code {code}): {message}")]
    Rejected {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("expected status field '{field}' is absent")]
    PropertyMissing { field: String },

    #[error("status field '{field}' is {value}, feature is disabled")]
    PropertyFalse { field: String, value: Bson },

    #[error("write to {namespace} not acknowledged ({acknowledged} of {expected} document(s))")]
    AcknowledgementMissing {
        namespace: String,
        expected: usize,
        acknowledged: usize,
    },

    #[error("no document in {namespace} matches {filter}")]
    DocumentNotFound { namespace: String, filter: Document },

    #[error("field '{field}' read back as {}, expected {expected}", display_actual(.actual))]
    ValueMismatch {
        field: String,
        expected: Bson,
        actual: Option<Bson>,
    },

    #[error("unexpected reply to {command}: {detail}")]
    UnexpectedReply { command: String, detail: String },
}

fn display_actual(actual: &Option<Bson>) -> String {
    match actual {
        Some(value) => value.to_string(),
        None => "<absent>".to_string(),
    }
}

impl From<GatewayError> for StageError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::NotYetInitialized { message } => StageError::Rejected {
                code: NOT_YET_INITIALIZED_CODE,
                code_name: "NotYetInitialized".to_string(),
                message,
            },
            GatewayError::Rejected {
                code,
                code_name,
                message,
            } => StageError::Rejected {
                code,
                code_name,
                message,
            },
            GatewayError::Transport { message } => StageError::Transport(message),
        }
    }
}

impl StageError {
    /// Whether the failure came from the transport rather than the data.
    pub fn is_transport(&self) -> bool {
        matches!(self, StageError::Transport(_))
    }

    /// Get suggestion for fixing this error.
    pub fn suggested_fix(&self) -> Option<String> {
        match self {
            StageError::Transport(_) => {
                Some("Check that mongod is running and the connection URI is reachable".to_string())
            }
            StageError::NotInitialized => {
                Some("Enable `replica_set.bootstrap` or run rs.initiate() manually".to_string())
            }
            StageError::PropertyMissing { .. } => Some(
                "Encryption at rest is not reported; start mongod with --enableEncryption"
                    .to_string(),
            ),
            StageError::PropertyFalse { field, .. } => {
                Some(format!("Enable encryption at rest so that '{}' reports true", field))
            }
            _ => None,
        }
    }
}

/// Errors loading or validating the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("exercise document #{index} cannot be converted to BSON: {source}")]
    Document {
        index: usize,
        source: mongodb::bson::ser::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for tdecheck operations.
pub type TdeResult<T> = Result<T, TdeError>;

/// Result type alias for gateway calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type alias for stage steps.
pub type StageResult<T> = Result<T, StageError>;
