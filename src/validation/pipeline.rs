//! Validation pipeline implementation.

use crate::core::config::Config;
use crate::core::error::{ConfigError, TdeResult};
use crate::core::types::{Outcome, RunId};
use crate::gateway::CommandGateway;
use crate::validation::exercise::ExercisePlan;
use crate::validation::poller::Sleeper;
use crate::validation::progress::{ProgressCallback, ProgressTracker};
use crate::validation::stages::{
    EncryptionAtRest, ReadWriteExercise, ReplicaSetReadiness, ValidationStage,
};
use log::{info, warn};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

/// One line of the pipeline trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    /// Stage name.
    pub stage: String,
    /// Stage outcome.
    pub outcome: Outcome,
    /// One-line description of the outcome.
    pub message: String,
    /// Non-fatal problems reported by the stage.
    pub warnings: Vec<String>,
    /// Wall-clock time spent in the stage.
    pub duration_ms: u64,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Identifier of this run.
    pub run_id: RunId,
    /// One entry per executed stage, in order.
    pub entries: Vec<TraceEntry>,
    /// Final outcome: the first non-success entry, or success.
    pub outcome: Outcome,
    /// Total run time.
    pub duration_ms: u64,
}

impl PipelineReport {
    /// Whether every stage succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Human-readable trace, one line per executed stage.
    pub fn summary(&self) -> String {
        let mut summary = String::new();
        for (index, entry) in self.entries.iter().enumerate() {
            let _ = writeln!(
                summary,
                "[{}] {}: {} ({}ms)",
                index + 1,
                entry.stage,
                entry.outcome,
                entry.duration_ms
            );
            for warning in &entry.warnings {
                let _ = writeln!(summary, "    warning: {}", warning);
            }
        }
        let _ = write!(summary, "Result: {}", self.outcome.label());
        summary
    }

    /// The report as pretty-printed JSON.
    pub fn to_json(&self) -> TdeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Ordered, short-circuiting sequence of validation stages.
///
/// Stages run strictly in order and the pipeline stops at the first stage
/// that does not succeed. Nothing is retried at this level.
pub struct ValidationPipeline {
    stages: Vec<Box<dyn ValidationStage>>,
    progress: Option<ProgressCallback>,
}

impl ValidationPipeline {
    /// Create a new pipeline with the given stages.
    pub fn new(stages: Vec<Box<dyn ValidationStage>>) -> Self {
        Self {
            stages,
            progress: None,
        }
    }

    /// The standard three-stage pipeline described by `config`.
    pub fn from_config(config: &Config, sleeper: Arc<dyn Sleeper>) -> Result<Self, ConfigError> {
        config.validate()?;
        let plan = ExercisePlan::from_config(&config.exercise)?;
        Ok(Self::new(vec![
            Box::new(ReplicaSetReadiness::from_config(&config.replica_set, sleeper)),
            Box::new(EncryptionAtRest::new(config.encryption.clone())),
            Box::new(ReadWriteExercise::new(plan)),
        ]))
    }

    /// Add a validation stage at the end.
    pub fn add_stage(&mut self, stage: Box<dyn ValidationStage>) {
        self.stages.push(stage);
    }

    /// Report progress events to `callback`.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Names of the configured stages, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage against `gateway` until one does not succeed.
    pub fn run(&self, gateway: &dyn CommandGateway) -> PipelineReport {
        let run_id = RunId::new();
        let mut tracker = ProgressTracker::start(run_id, self.stages.len(), self.progress.as_ref());
        let mut entries = Vec::with_capacity(self.stages.len());
        let mut outcome = Outcome::success(format!("all {} stage(s) passed", self.stages.len()));

        info!("run {}: {} stage(s)", run_id, self.stages.len());
        for stage in &self.stages {
            tracker.stage_started(stage.name());
            let start = Instant::now();
            let report = stage.run(gateway);
            let duration_ms = start.elapsed().as_millis() as u64;
            tracker.stage_completed(stage.name(), duration_ms, report.outcome.label());

            for warning in &report.warnings {
                warn!("{}: {}", stage.name(), warning);
            }
            info!("{}: {}", stage.name(), report.outcome);

            let stop = !report.outcome.is_success();
            if stop {
                outcome = report.outcome.clone();
            }
            entries.push(TraceEntry {
                stage: stage.name().to_string(),
                message: report.outcome.message(),
                outcome: report.outcome,
                warnings: report.warnings,
                duration_ms,
            });
            if stop {
                break;
            }
        }

        let duration_ms = tracker.complete(outcome.label());
        PipelineReport {
            run_id,
            entries,
            outcome,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StageError;
    use crate::gateway::{CommandKind, EncryptionState, MemoryGateway};
    use crate::test_support::RecordingSleeper;
    use crate::validation::progress::ProgressUpdate;
    use crate::validation::stages::StageReport;
    use parking_lot::Mutex;

    struct Fixed(&'static str, Outcome);

    impl ValidationStage for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn run(&self, _gateway: &dyn CommandGateway) -> StageReport {
            StageReport::new(self.1.clone())
        }
    }

    fn standard(sleeper: &Arc<RecordingSleeper>) -> ValidationPipeline {
        ValidationPipeline::from_config(&Config::default(), sleeper.clone()).unwrap()
    }

    #[test]
    fn test_all_stages_succeed() {
        let gateway = MemoryGateway::uninitialized(2);
        let sleeper = Arc::new(RecordingSleeper::default());

        let pipeline = standard(&sleeper);
        assert_eq!(
            pipeline.stage_names(),
            vec!["replica-set readiness", "encryption at rest", "read/write exercise"]
        );

        let report = pipeline.run(&gateway);

        assert!(report.is_success(), "{}", report.summary());
        assert_eq!(report.entries.len(), 3);
        assert!(report.entries.iter().all(|entry| entry.outcome.is_success()));
        assert_eq!(
            report.entries.iter().map(|entry| entry.stage.as_str()).collect::<Vec<_>>(),
            vec!["replica-set readiness", "encryption at rest", "read/write exercise"]
        );
        assert_eq!(gateway.count(CommandKind::DropDatabase), 1);
        assert_eq!(sleeper.count(), 2);
    }

    #[test]
    fn test_encryption_disabled_stops_before_exercise() {
        let gateway = MemoryGateway::primary().with_encryption(EncryptionState::Disabled);
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = standard(&sleeper).run(&gateway);

        assert_eq!(report.entries.len(), 2);
        assert!(matches!(report.outcome.error(), Some(StageError::PropertyFalse { .. })));
        assert_eq!(report.outcome.exit_code(), 1);
        assert_eq!(gateway.count(CommandKind::Insert), 0);
        assert!(gateway.calls().iter().all(|kind| !kind.is_cleanup()));
    }

    #[test]
    fn test_never_ready_times_out() {
        let gateway = MemoryGateway::electing(100);
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut config = Config::default();
        config.replica_set.max_attempts = 3;

        let pipeline = ValidationPipeline::from_config(&config, sleeper.clone()).unwrap();
        let report = pipeline.run(&gateway);

        assert_eq!(report.entries.len(), 1);
        assert!(matches!(report.outcome, Outcome::TimedOut { attempts: 3, .. }));
        assert_eq!(report.outcome.exit_code(), 2);
        assert_eq!(gateway.count(CommandKind::ServerStatus), 0);
    }

    #[test]
    fn test_empty_pipeline_succeeds() {
        let report = ValidationPipeline::new(Vec::new()).run(&MemoryGateway::primary());
        assert!(report.is_success());
        assert!(report.entries.is_empty());
    }

    #[test]
    fn test_progress_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let first: Box<dyn ValidationStage> = Box::new(Fixed("first", Outcome::success("ok")));
        let mut pipeline = ValidationPipeline::new(vec![first])
            .with_progress(Box::new(move |update| sink.lock().push(update)));
        pipeline.add_stage(Box::new(Fixed(
            "second",
            Outcome::failure(StageError::Transport("down".to_string())),
        )));
        pipeline.add_stage(Box::new(Fixed("third", Outcome::success("unreachable"))));

        let report = pipeline.run(&MemoryGateway::primary());

        assert_eq!(report.entries.len(), 2);
        let events = events.lock();
        assert_eq!(events.len(), 6);
        assert!(matches!(
            events.last(),
            Some(ProgressUpdate::Completed { stages_run: 2, label: "FAILURE", .. })
        ));
    }

    #[test]
    fn test_summary_lists_stages_in_order() {
        let pipeline = ValidationPipeline::new(vec![
            Box::new(Fixed("first", Outcome::success("ok"))),
            Box::new(Fixed("second", Outcome::success("fine"))),
        ]);
        let summary = pipeline.run(&MemoryGateway::primary()).summary();
        let lines: Vec<&str> = summary.lines().collect();
        assert!(lines[0].starts_with("[1] first: SUCCESS: ok"));
        assert!(lines[1].starts_with("[2] second: SUCCESS: fine"));
        assert_eq!(lines[2], "Result: SUCCESS");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.replica_set.max_attempts = 0;
        let sleeper = Arc::new(RecordingSleeper::default());
        let result = ValidationPipeline::from_config(&config, sleeper);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
