//! Individual validation stages.
//!
//! Each stage wraps one component and turns its result into a
//! [`StageReport`]. Stages never return errors; every gateway failure is
//! already an [`Outcome`] by the time it leaves `run`.

use crate::core::config::{EncryptionConfig, ReplicaSetConfig};
use crate::core::types::Outcome;
use crate::gateway::{Command, CommandGateway};
use crate::validation::exercise::{ExercisePlan, ExerciseRunner};
use crate::validation::poller::{state_equals, PollPolicy, ReadinessPoller, Sleeper};
use crate::validation::property::{encryption_enabled, PropertyValidator};
use log::debug;
use serde::Serialize;
use std::sync::Arc;

/// Trait for validation stages.
pub trait ValidationStage: Send + Sync {
    /// Name of this validation stage.
    fn name(&self) -> &str;

    /// Run the stage against a deployment.
    fn run(&self, gateway: &dyn CommandGateway) -> StageReport;
}

/// What one stage returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    /// Outcome of the stage.
    pub outcome: Outcome,
    /// Non-fatal problems noticed along the way.
    pub warnings: Vec<String>,
}

impl StageReport {
    /// A report with no warnings.
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            warnings: Vec::new(),
        }
    }

    /// Attach warnings.
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }
}

/// Replica-set readiness - waits for the node to become primary.
///
/// Bootstraps the replica set with `replSetInitiate` when the first probe
/// says it has never been initiated and bootstrap is enabled.
pub struct ReplicaSetReadiness {
    policy: PollPolicy,
    bootstrap: Option<Command>,
    state_field: String,
    ready_state: i64,
    sleeper: Arc<dyn Sleeper>,
}

impl ReplicaSetReadiness {
    /// Build the stage from the `[replica_set]` section.
    pub fn from_config(config: &ReplicaSetConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        let bootstrap = config.bootstrap.then(|| Command::ReplicaSetInitiate {
            config: config.initiate_document(),
        });
        Self {
            policy: PollPolicy::new(config.max_attempts, config.interval()),
            bootstrap,
            state_field: config.state_field.clone(),
            ready_state: config.ready_state,
            sleeper,
        }
    }
}

impl ValidationStage for ReplicaSetReadiness {
    fn name(&self) -> &str {
        "replica-set readiness"
    }

    fn run(&self, gateway: &dyn CommandGateway) -> StageReport {
        let mut poller =
            ReadinessPoller::new(gateway, self.sleeper.as_ref(), Command::ReplicaSetStatus);
        if let Some(command) = &self.bootstrap {
            poller = poller.with_bootstrap(command.clone());
        }

        let ready = state_equals(&self.state_field, self.ready_state);
        let report = poller.wait_until_ready(ready, &self.policy);
        debug!(
            "readiness: {:?} after {} quer(ies), {} delay(s), bootstrapped: {}",
            report.state, report.status_queries, report.delays, report.bootstrapped
        );

        let outcome = match report.outcome {
            Outcome::Success { message } if report.bootstrapped => {
                Outcome::success(format!("replica set initiated; {}", message))
            }
            other => other,
        };
        StageReport::new(outcome)
    }
}

/// Encryption at rest - one `serverStatus` query, no retries.
pub struct EncryptionAtRest {
    fields: EncryptionConfig,
}

impl EncryptionAtRest {
    /// Build the stage from the `[encryption]` section.
    pub fn new(fields: EncryptionConfig) -> Self {
        Self { fields }
    }
}

impl ValidationStage for EncryptionAtRest {
    fn name(&self) -> &str {
        "encryption at rest"
    }

    fn run(&self, gateway: &dyn CommandGateway) -> StageReport {
        let report = PropertyValidator::new(gateway)
            .check_property(&Command::ServerStatus, encryption_enabled(&self.fields));
        StageReport::new(report.outcome)
    }
}

/// Read/write exercise against the scratch namespace.
pub struct ReadWriteExercise {
    plan: ExercisePlan,
}

impl ReadWriteExercise {
    /// Wrap an exercise plan.
    pub fn new(plan: ExercisePlan) -> Self {
        Self { plan }
    }
}

impl ValidationStage for ReadWriteExercise {
    fn name(&self) -> &str {
        "read/write exercise"
    }

    fn run(&self, gateway: &dyn CommandGateway) -> StageReport {
        let report = ExerciseRunner::new(gateway).run(&self.plan);
        for step in &report.steps {
            debug!("exercise step {}: {}", step.name, step.outcome);
        }
        StageReport::new(report.outcome).with_warnings(report.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ExerciseConfig;
    use crate::core::error::StageError;
    use crate::gateway::{CommandKind, EncryptionState, MemoryGateway};
    use crate::test_support::RecordingSleeper;

    #[test]
    fn test_readiness_bootstraps_uninitialized_node() {
        let gateway = MemoryGateway::uninitialized(1);
        let sleeper = Arc::new(RecordingSleeper::default());
        let stage = ReplicaSetReadiness::from_config(&ReplicaSetConfig::default(), sleeper.clone());

        let report = stage.run(&gateway);

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert!(report.outcome.message().starts_with("replica set initiated"));
        assert_eq!(gateway.count(CommandKind::ReplicaSetInitiate), 1);
        assert_eq!(sleeper.count(), 1);
    }

    #[test]
    fn test_readiness_without_bootstrap_fails() {
        let gateway = MemoryGateway::uninitialized(0);
        let config = ReplicaSetConfig {
            bootstrap: false,
            ..ReplicaSetConfig::default()
        };
        let sleeper = Arc::new(RecordingSleeper::default());
        let stage = ReplicaSetReadiness::from_config(&config, sleeper);

        let report = stage.run(&gateway);

        assert_eq!(report.outcome.error(), Some(&StageError::NotInitialized));
        assert_eq!(gateway.count(CommandKind::ReplicaSetInitiate), 0);
    }

    #[test]
    fn test_encryption_stage_reports_false_flag() {
        let gateway = MemoryGateway::primary().with_encryption(EncryptionState::Disabled);
        let report = EncryptionAtRest::new(EncryptionConfig::default()).run(&gateway);
        assert!(matches!(report.outcome.error(), Some(StageError::PropertyFalse { .. })));
    }

    #[test]
    fn test_exercise_stage_carries_cleanup_warning() {
        let gateway = MemoryGateway::primary();
        gateway.fail_next(
            CommandKind::DropDatabase,
            crate::core::error::GatewayError::transport("connection reset"),
        );
        let plan = ExercisePlan::from_config(&ExerciseConfig::default()).unwrap();

        let report = ReadWriteExercise::new(plan).run(&gateway);

        assert!(report.outcome.is_success(), "{}", report.outcome);
        assert_eq!(report.warnings.len(), 1);
    }
}
