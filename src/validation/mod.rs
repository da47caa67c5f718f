//! Validation module: the staged checks run against a deployment.
//!
//! The pipeline runs readiness, encryption and exercise stages in order and
//! stops at the first one that does not succeed.

pub mod exercise;
pub mod pipeline;
pub mod poller;
pub mod progress;
pub mod property;
pub mod stages;

pub use exercise::{
    ExerciseCheck, ExercisePlan, ExerciseReport, ExerciseRunner, ReadSpec, WriteSpec,
};
pub use pipeline::{PipelineReport, TraceEntry, ValidationPipeline};
pub use poller::{PollPolicy, PollReport, PollState, ReadinessPoller, Sleeper, ThreadSleeper};
pub use progress::{ProgressCallback, ProgressUpdate};
pub use property::{PropertyReport, PropertyValidator, PropertyVerdict};
pub use stages::{
    EncryptionAtRest, ReadWriteExercise, ReplicaSetReadiness, StageReport, ValidationStage,
};
