//! Core value types that flow through the validation pipeline.
//!
//! Everything returned by the external deployment is carried as BSON, so the
//! helpers here deal with the two things every stage needs: walking nested
//! status documents and comparing numbers across BSON's integer and double
//! representations.

use crate::core::error::StageError;
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Relative tolerance used when comparing derived numeric results.
pub const NUMERIC_TOLERANCE: f64 = 1e-9;

/// Unique identifier for one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A database + collection pair addressed by data commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace {
    /// Database name.
    pub database: String,
    /// Collection name.
    pub collection: String,
}

impl Namespace {
    /// Create a namespace from its two parts.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// Immutable reply of a status query.
///
/// A fresh snapshot is fetched for every poll attempt; nothing is cached
/// between attempts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StatusSnapshot {
    document: Document,
}

impl StatusSnapshot {
    /// Wrap a status reply.
    pub fn new(document: Document) -> Self {
        Self { document }
    }

    /// The raw reply document.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Resolve a dotted path such as `encryptionAtRest.encryptionEnabled`.
    pub fn lookup(&self, path: &str) -> Option<&Bson> {
        let mut segments = path.split('.');
        let mut current = self.document.get(segments.next()?)?;
        for segment in segments {
            current = current.as_document()?.get(segment)?;
        }
        Some(current)
    }

    /// Integer value at `path`, accepting any BSON numeric representation.
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.lookup(path).and_then(as_i64)
    }

    /// Boolean value at `path`.
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.lookup(path).and_then(Bson::as_bool)
    }

    /// String value at `path`.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Bson::as_str)
    }
}

impl From<Document> for StatusSnapshot {
    fn from(document: Document) -> Self {
        Self::new(document)
    }
}

/// Result of one component or stage.
///
/// `TimedOut` is kept apart from `Failure` so callers can tell "never became
/// ready" from "became ready but failed a check".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The stage passed.
    Success {
        /// Human-readable description of what was verified.
        message: String,
    },
    /// The stage ran and found a problem.
    Failure {
        /// What went wrong.
        error: StageError,
    },
    /// Polling exhausted its attempt budget.
    TimedOut {
        /// Number of status queries issued.
        attempts: u32,
        /// The last snapshot observed, for diagnostics.
        last_snapshot: Option<StatusSnapshot>,
    },
}

impl Outcome {
    /// Build a success outcome.
    pub fn success(message: impl Into<String>) -> Self {
        Outcome::Success {
            message: message.into(),
        }
    }

    /// Build a failure outcome.
    pub fn failure(error: StageError) -> Self {
        Outcome::Failure { error }
    }

    /// Whether this outcome lets the pipeline continue.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }

    /// The failure reason, if any.
    pub fn error(&self) -> Option<&StageError> {
        match self {
            Outcome::Failure { error } => Some(error),
            _ => None,
        }
    }

    /// Short upper-case label used in the trace.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "SUCCESS",
            Outcome::Failure { .. } => "FAILURE",
            Outcome::TimedOut { .. } => "TIMED OUT",
        }
    }

    /// One-line description of the outcome.
    pub fn message(&self) -> String {
        match self {
            Outcome::Success { message } => message.clone(),
            Outcome::Failure { error } => error.to_string(),
            Outcome::TimedOut {
                attempts,
                last_snapshot,
            } => {
                let state = last_snapshot
                    .as_ref()
                    .and_then(|snapshot| snapshot.get_str("myStateStr"))
                    .map(|state| format!(", last state {}", state))
                    .unwrap_or_default();
                format!("not ready after {} attempt(s){}", attempts, state)
            }
        }
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Success { .. } => 0,
            Outcome::Failure { .. } => 1,
            Outcome::TimedOut { .. } => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label(), self.message())
    }
}

// ============================================================================
// Numeric helpers
// ============================================================================

/// Numeric value of a BSON scalar as `f64`.
pub fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// Integral value of a BSON scalar. Doubles qualify only without a fraction.
pub fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Value-level equality: numbers compare by value across representations,
/// everything else by BSON equality.
pub fn values_equal(left: &Bson, right: &Bson) -> bool {
    match (as_f64(left), as_f64(right)) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

/// Compare two derived floating point results with [`NUMERIC_TOLERANCE`].
pub fn approx_equal(left: f64, right: f64) -> bool {
    let scale = left.abs().max(right.abs()).max(1.0);
    (left - right).abs() <= NUMERIC_TOLERANCE * scale
}
