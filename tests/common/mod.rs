//! Test utility functions for llmrunner
#![allow(dead_code)]

use async_trait::async_trait;
use llmrunner::command::{CommandError, CommandOutcome, CommandRunner, Invocation};
use llmrunner::core::{
    ExecutionStatus, FailureCategory, Pipeline, PipelineResult, RunContext, RunOptions, StepRecord, StepStatus,
};
use llmrunner::execution::ExecutionEngine;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Mock runner that records invocations; exit codes are scripted per step id
#[derive(Clone, Default)]
pub struct MockRunner {
    exit_codes: Arc<HashMap<String, i32>>,
    calls: Arc<Mutex<Vec<Invocation>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runner where the listed steps exit with the given codes, all others with 0
    pub fn with_exit_codes(codes: &[(&str, i32)]) -> Self {
        Self {
            exit_codes: Arc::new(codes.iter().map(|(id, code)| (id.to_string(), *code)).collect()),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invoked_ids(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.step_id).collect()
    }

    pub fn invocation(&self, step_id: &str) -> Option<Invocation> {
        self.calls().into_iter().find(|c| c.step_id == step_id)
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome, CommandError> {
        self.calls.lock().unwrap().push(invocation.clone());
        Ok(CommandOutcome {
            exit_code: self.exit_codes.get(&invocation.step_id).copied().unwrap_or(0),
        })
    }
}

/// Isolated repository tree: `configs/exp/` holds the pipeline, `datapool/`
/// is the default datapool
pub struct Workspace {
    temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn config_dir(&self) -> PathBuf {
        self.path("configs/exp")
    }

    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Write a step config into `configs/exp/steps/<id>.yaml`
    pub fn step_config(&self, step_id: &str, content: &str) -> PathBuf {
        self.write(&format!("configs/exp/steps/{}.yaml", step_id), content)
    }

    /// Write `configs/exp/pipeline.yaml` and load it for a run
    pub fn load(&self, yaml: &str, dry_run: bool) -> (Pipeline, RunContext) {
        let path = self.write("configs/exp/pipeline.yaml", yaml);
        let pipeline = Pipeline::load(&path).unwrap();
        let ctx = self.context(&pipeline, dry_run);
        (pipeline, ctx)
    }

    pub fn context(&self, pipeline: &Pipeline, dry_run: bool) -> RunContext {
        let options = RunOptions {
            root_dir: self.root().to_path_buf(),
            config_dir: pipeline.config_dir.clone(),
            run_id: Some("test-run".to_string()),
            dry_run,
            allow_external_paths: false,
        };
        RunContext::from_config(&pipeline.variables, &options).unwrap()
    }

    /// Every file under the workspace, relative, sorted
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = walkdir::WalkDir::new(self.root())
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file() || e.file_type().is_dir())
            .map(|e| e.path().strip_prefix(self.root()).unwrap().to_path_buf())
            .collect();
        files.sort();
        files
    }
}

/// Run a pipeline with a mock runner
pub async fn run_with_mock(pipeline: &Pipeline, ctx: &RunContext, runner: MockRunner) -> PipelineResult {
    let engine = ExecutionEngine::new(runner);
    engine.execute(pipeline, ctx).await
}

// Assertion helpers

pub fn assert_pipeline_completed(result: &PipelineResult) {
    assert_eq!(
        result.status,
        ExecutionStatus::Done,
        "expected DONE, got {:?} ({:?})",
        result.status,
        result.failure
    );
    assert_eq!(result.exit_code(), 0);
}

pub fn assert_pipeline_failed(result: &PipelineResult, category: FailureCategory) {
    assert_eq!(result.status, ExecutionStatus::Failed);
    let failure = result.failure.as_ref().expect("failed result carries a failure");
    assert_eq!(failure.category, category, "failure: {}", failure.message);
    assert_eq!(result.exit_code(), category.exit_code());
}

pub fn step<'a>(result: &'a PipelineResult, step_id: &str) -> &'a StepRecord {
    result
        .step(step_id)
        .unwrap_or_else(|| panic!("no record for step {}", step_id))
}

pub fn assert_step_status(result: &PipelineResult, step_id: &str, status: StepStatus) {
    assert_eq!(step(result, step_id).status, status, "step {}", step_id);
}

pub fn assert_record_order(result: &PipelineResult, expected: &[&str]) {
    let actual: Vec<_> = result.steps.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(actual, expected);
}
