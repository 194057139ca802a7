//! Error taxonomy for pipeline runs
//!
//! Every failure a run can end with maps onto a [`FailureCategory`], which in
//! turn fixes the process exit code of the orchestrator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration problems: malformed step lists, identity violations,
/// unresolvable variables, unreadable config files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown step type '{0}'")]
    UnknownStepType(String),

    #[error("step entry #{position} has no 'type'")]
    MissingStepType { position: usize },

    #[error("invalid step id '{id}': expected <step_type>_<non-negative integer>")]
    InvalidIdFormat { id: String },

    #[error("step id '{id}' names type '{parsed}' but the entry declares type '{declared}'")]
    TypeMismatch {
        id: String,
        declared: String,
        parsed: String,
    },

    #[error("duplicate step id '{0}'")]
    DuplicateId(String),

    #[error("config file '{config}' must be named after step id '{id}'")]
    ConfigStemMismatch { id: String, config: String },

    #[error("step id '{id}' must end with its occurrence index {expected}")]
    IdOccurrenceMismatch { id: String, expected: usize },

    #[error("step '{step}' is missing required key {key}")]
    MissingRequiredKey { step: String, key: String },

    #[error("cyclic variable substitution: {}", .chain.join(" -> "))]
    CyclicSubstitution { chain: Vec<String> },

    #[error("config file not found: {}", .0.display())]
    ConfigFileNotFound(PathBuf),

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("include cycle detected at {}", .0.display())]
    IncludeCycle(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Datapool staging failures
#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("prepare failed: {}", .failures.join("; "))]
    Failed { failures: Vec<String> },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors that end a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error(
        "step '{step_id}': {key}={} is outside datapool {} and run directory {}",
        .path.display(),
        .datapool_root.display(),
        .run_dir.display()
    )]
    PathSandboxViolation {
        step_id: String,
        key: String,
        path: PathBuf,
        datapool_root: PathBuf,
        run_dir: PathBuf,
    },

    #[error("step '{step_id}' failed ({message}), see {}", .log_path.display())]
    StepExecution {
        step_id: String,
        exit_code: Option<i32>,
        log_path: PathBuf,
        message: String,
    },
}

impl PipelineError {
    pub fn category(&self) -> FailureCategory {
        match self {
            PipelineError::Configuration(_) => FailureCategory::Configuration,
            // Config errors raised while staging are still configuration errors
            PipelineError::Prepare(PrepareError::Config(_)) => FailureCategory::Configuration,
            PipelineError::Prepare(_) => FailureCategory::Prepare,
            PipelineError::PathSandboxViolation { .. } => FailureCategory::PathSandbox,
            PipelineError::StepExecution { .. } => FailureCategory::StepExecution,
        }
    }
}

/// Failure category of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Configuration,
    Prepare,
    StepExecution,
    PathSandbox,
}

impl FailureCategory {
    /// Process exit code reported for this category
    pub fn exit_code(self) -> i32 {
        match self {
            FailureCategory::Configuration => 2,
            FailureCategory::Prepare => 3,
            FailureCategory::StepExecution => 4,
            FailureCategory::PathSandbox => 5,
        }
    }
}
