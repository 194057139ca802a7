//! Execution state models

use crate::core::error::{FailureCategory, PipelineError};
use crate::prepare::PrepareReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Phase of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    /// Datapool staging
    Prepare,
    /// Steps are running in order
    Executing,
    /// Every enabled step succeeded
    Done,
    /// The run stopped on an error
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Done | ExecutionStatus::Failed)
    }
}

/// Outcome of one step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Why a step did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// `enabled: false`
    Disabled,
    /// An earlier failure stopped the run first
    NotReached,
}

/// Per-instance entry of a [`PipelineResult`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub log_path: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Command that ran, or would have run in dry-run mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn skipped(step_id: &str, reason: SkipReason) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            exit_code: None,
            log_path: None,
            duration: Duration::ZERO,
            skip_reason: Some(reason),
            command: None,
            error: None,
        }
    }
}

/// Failure summary of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub category: FailureCategory,
    pub message: String,
    /// Failing instance, when the failure belongs to one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl From<&PipelineError> for RunFailure {
    fn from(error: &PipelineError) -> Self {
        let step_id = match error {
            PipelineError::PathSandboxViolation { step_id, .. }
            | PipelineError::StepExecution { step_id, .. } => Some(step_id.clone()),
            _ => None,
        };
        Self {
            category: error.category(),
            message: error.to_string(),
            step_id,
        }
    }
}

/// Report of a whole pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Unique execution ID
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub run_id: String,
    pub status: ExecutionStatus,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prepare: Option<PrepareReport>,
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineResult {
    /// Create a result for a run that is about to start
    pub fn new(pipeline_name: &str, run_id: &str, dry_run: bool) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.to_string(),
            run_id: run_id.to_string(),
            status: ExecutionStatus::Prepare,
            dry_run,
            prepare: None,
            steps: Vec::new(),
            failure: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark the run as finished successfully
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Done;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run as failed
    pub fn fail(&mut self, error: &PipelineError) {
        self.status = ExecutionStatus::Failed;
        self.failure = Some(RunFailure::from(error));
        self.completed_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Done
    }

    /// Process exit code for this result
    pub fn exit_code(&self) -> i32 {
        match (&self.status, &self.failure) {
            (ExecutionStatus::Done, _) => 0,
            (_, Some(failure)) => failure.category.exit_code(),
            _ => 1,
        }
    }

    /// Write the result as pretty JSON, creating the parent directory
    pub fn write_report(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Count of records with the given status
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// Wall-clock duration, once completed
    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|end| end.signed_duration_since(self.started_at).to_std().ok())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
