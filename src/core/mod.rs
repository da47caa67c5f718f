//! Core types shared by every stage of the validation pipeline.
//!
//! This module contains:
//! - Value types (namespaces, status snapshots, outcomes)
//! - Error types
//! - Configuration

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use config::{CleanupMode, Config};
pub use error::{ConfigError, GatewayError, StageError, TdeError};
pub use types::{Namespace, Outcome, RunId, StatusSnapshot};
