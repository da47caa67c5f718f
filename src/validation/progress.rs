//! Progress reporting for pipeline runs.

use crate::core::types::RunId;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// The run has started.
    Started {
        run_id: RunId,
        total_stages: usize,
    },
    /// A stage has started.
    StageStarted {
        name: String,
        index: usize,
        total: usize,
    },
    /// A stage has finished, successfully or not.
    StageCompleted {
        name: String,
        index: usize,
        total: usize,
        duration_ms: u64,
        /// Outcome label (`SUCCESS`, `FAILURE`, `TIMED OUT`).
        label: &'static str,
    },
    /// The run has finished.
    Completed {
        total_duration_ms: u64,
        stages_run: usize,
        label: &'static str,
    },
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Forwards pipeline events to an optional callback and keeps run timing.
pub(crate) struct ProgressTracker<'a> {
    total_stages: usize,
    stages_run: usize,
    start_time: Instant,
    callback: Option<&'a ProgressCallback>,
}

impl<'a> ProgressTracker<'a> {
    /// Start tracking a run of `total_stages` stages.
    pub(crate) fn start(
        run_id: RunId,
        total_stages: usize,
        callback: Option<&'a ProgressCallback>,
    ) -> Self {
        let tracker = Self {
            total_stages,
            stages_run: 0,
            start_time: Instant::now(),
            callback,
        };
        tracker.send_update(ProgressUpdate::Started { run_id, total_stages });
        tracker
    }

    pub(crate) fn stage_started(&self, name: &str) {
        self.send_update(ProgressUpdate::StageStarted {
            name: name.to_string(),
            index: self.stages_run,
            total: self.total_stages,
        });
    }

    pub(crate) fn stage_completed(&mut self, name: &str, duration_ms: u64, label: &'static str) {
        self.stages_run += 1;
        self.send_update(ProgressUpdate::StageCompleted {
            name: name.to_string(),
            index: self.stages_run,
            total: self.total_stages,
            duration_ms,
            label,
        });
    }

    /// Finish tracking and return the total duration.
    pub(crate) fn complete(&self, label: &'static str) -> u64 {
        let total_duration_ms = self.elapsed_ms();
        self.send_update(ProgressUpdate::Completed {
            total_duration_ms,
            stages_run: self.stages_run,
            label,
        });
        total_duration_ms
    }

    pub(crate) fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(callback) = self.callback {
            callback(update);
        }
    }
}
