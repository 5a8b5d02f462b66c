//! Run Results

use serde::Serialize;

use crate::error::StageError;
use crate::stage::FieldMap;

/// Execution state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running(String),
    Completed,
    Failed(String),
    /// Cancelled before the named stage started.
    Cancelled(String),
}

/// Processing Statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProcessingStats {
    /// Number of stages executed
    pub stages_run: usize,
    pub total_duration_ms: u64,
    /// Per-stage durations (stage_id, duration_ms)
    pub stage_durations: Vec<(String, u64)>,
}

impl ProcessingStats {
    pub fn record_stage(&mut self, stage: String, duration_ms: u64) {
        self.stages_run += 1;
        self.total_duration_ms += duration_ms;
        self.stage_durations.push((stage, duration_ms));
    }
}

/// Outcome of one pipeline run.
///
/// On failure or cancellation `context` holds whatever had been merged before
/// the run stopped.
#[derive(Debug)]
pub struct PipelineRun {
    pub state: ExecutionState,
    /// Every state the run passed through, starting with `Pending`.
    pub transitions: Vec<ExecutionState>,
    pub context: FieldMap,
    pub error: Option<StageError>,
    pub stats: ProcessingStats,
}

impl PipelineRun {
    pub fn is_completed(&self) -> bool {
        self.state == ExecutionState::Completed
    }

    pub fn failed_stage(&self) -> Option<&str> {
        match &self.state {
            ExecutionState::Failed(stage) => Some(stage),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state, ExecutionState::Cancelled(_))
    }
}
