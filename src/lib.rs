//! # tdecheck - Guarded validation of MongoDB encryption at rest
//!
//! tdecheck verifies that a freshly started storage node is coordinated,
//! reports encryption at rest, and stores and returns data correctly. It runs
//! a short pipeline of checks against the node and stops at the first one
//! that fails.
//!
//! ## Features
//!
//! - **Readiness polling**: bounded polling of `replSetGetStatus`, with a
//!   one-time `replSetInitiate` when the node has never been initiated
//! - **Property checks**: a single `serverStatus` query tells "encryption
//!   section missing" apart from "encryption disabled"
//! - **Read/write exercise**: write, read back, sum, increment and statistics
//!   against a scratch namespace that is always cleaned up
//! - **Simulated deployment**: [`gateway::MemoryGateway`] runs the whole
//!   pipeline in-process
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tdecheck::prelude::*;
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let gateway = MongoGateway::connect(&config.connection.uri)?;
//!
//! let pipeline = ValidationPipeline::from_config(&config, Arc::new(ThreadSleeper))?;
//! let report = pipeline.run(&gateway);
//!
//! println!("{}", report.summary());
//! std::process::exit(report.outcome.exit_code() as i32);
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: configuration, errors and the values passed between stages
//! - [`gateway`]: the command boundary to the deployment
//! - [`validation`]: poller, property validator, exercise runner and the
//!   pipeline that sequences them
//!
//! ## Custom stages
//!
//! Implement [`validation::ValidationStage`] and append it with
//! [`validation::ValidationPipeline::add_stage`]:
//!
//! ```rust,ignore
//! use tdecheck::prelude::*;
//!
//! struct VersionCheck;
//!
//! impl ValidationStage for VersionCheck {
//!     fn name(&self) -> &str {
//!         "server version"
//!     }
//!
//!     fn run(&self, gateway: &dyn CommandGateway) -> StageReport {
//!         let validator = PropertyValidator::new(gateway);
//!         let report = validator.check_property(&Command::ServerStatus, |status| {
//!             match status.get_str("version") {
//!                 Some(version) => PropertyVerdict::Holds(format!("server {}", version)),
//!                 None => PropertyVerdict::Missing { field: "version".to_string() },
//!             }
//!         });
//!         StageReport::new(report.outcome)
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod core;
pub mod gateway;
pub mod validation;

/// Prelude module for convenient imports.
///
/// Import everything commonly needed with:
/// ```rust,ignore
/// use tdecheck::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use crate::core::types::{Namespace, Outcome, RunId, StatusSnapshot};

    // Configuration
    pub use crate::core::config::{CleanupMode, Config, DEFAULT_CONFIG_FILE};

    // Errors
    pub use crate::core::error::{ConfigError, GatewayError, StageError, TdeError, TdeResult};

    // Gateway
    pub use crate::gateway::{
        Command, CommandGateway, CommandKind, MemoryGateway, MongoGateway, Payload, Response,
    };

    // Validation
    pub use crate::validation::exercise::{ExercisePlan, ExerciseRunner, ReadSpec, WriteSpec};
    pub use crate::validation::pipeline::{PipelineReport, TraceEntry, ValidationPipeline};
    pub use crate::validation::poller::{PollPolicy, ReadinessPoller, Sleeper, ThreadSleeper};
    pub use crate::validation::progress::{ProgressCallback, ProgressUpdate};
    pub use crate::validation::property::{PropertyValidator, PropertyVerdict};
    pub use crate::validation::stages::{StageReport, ValidationStage};
}

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
