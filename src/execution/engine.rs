//! Main execution engine - orchestrates the entire pipeline run
//!
//! A run moves through `PREPARE -> EXECUTING -> DONE | FAILED`. Every enabled
//! step is planned before the first one starts, so configuration errors
//! surface before anything is launched. Steps then run strictly in list
//! order and the first failure stops the run.

use crate::{
    command::CommandRunner,
    core::{
        ConfigError, ExecutionStatus, Pipeline, PipelineError, PipelineResult, RunContext, SkipReason,
        StepRecord, StepStatus,
    },
    execution::{
        executor::{plan_step, StepExecutor, StepPlan},
        sandbox,
    },
    prepare::{prepare, PrepareOptions, RawDataStatus},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        run_id: String,
        dry_run: bool,
    },
    PrepareCompleted {
        created_dirs: usize,
        merged_files: usize,
        warnings: Vec<String>,
    },
    StepStarted {
        step_id: String,
        position: usize,
        total: usize,
    },
    /// Command that would have been launched in a dry run
    DryRunCommand {
        step_id: String,
        command: String,
    },
    StepSkipped {
        step_id: String,
        reason: SkipReason,
    },
    StepCompleted {
        step_id: String,
        duration: Duration,
    },
    StepFailed {
        step_id: String,
        error: String,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Main pipeline execution engine
pub struct ExecutionEngine<R> {
    executor: StepExecutor<R>,
    prepare_options: PrepareOptions,
    event_handlers: Vec<EventHandler>,
}

impl<R: CommandRunner> ExecutionEngine<R> {
    pub fn new(runner: R) -> Self {
        Self {
            executor: StepExecutor::new(runner),
            prepare_options: PrepareOptions::default(),
            event_handlers: Vec::new(),
        }
    }

    pub fn with_prepare_options(mut self, options: PrepareOptions) -> Self {
        self.prepare_options = options;
        self
    }

    pub fn runner(&self) -> &R {
        self.executor.runner()
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Plan every enabled step; disabled steps get `None`
    pub fn plan_steps(&self, pipeline: &Pipeline, ctx: &RunContext) -> Result<Vec<Option<StepPlan>>, ConfigError> {
        pipeline
            .steps
            .iter()
            .map(|instance| {
                if instance.enabled {
                    plan_step(pipeline, instance, ctx).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect()
    }

    /// Plan every enabled step and check its paths against the sandbox,
    /// without launching anything
    pub fn validate(&self, pipeline: &Pipeline, ctx: &RunContext) -> Result<Vec<Option<StepPlan>>, PipelineError> {
        let plans = self.plan_steps(pipeline, ctx)?;
        for plan in plans.iter().flatten() {
            sandbox::check(plan.step_id(), &plan.resolved, ctx)?;
        }
        Ok(plans)
    }

    /// Execute the entire pipeline
    pub async fn execute(&self, pipeline: &Pipeline, ctx: &RunContext) -> PipelineResult {
        let mut result = PipelineResult::new(&pipeline.name, &ctx.run_id, ctx.dry_run);

        info!(
            "Starting pipeline execution: {} (run {}{})",
            pipeline.name,
            ctx.run_id,
            if ctx.dry_run { ", dry-run" } else { "" }
        );
        self.emit_event(ExecutionEvent::PipelineStarted {
            execution_id: result.execution_id,
            pipeline_name: pipeline.name.clone(),
            run_id: ctx.run_id.clone(),
            dry_run: ctx.dry_run,
        });

        match prepare(pipeline, ctx, &self.prepare_options) {
            Ok(report) => {
                let merged_files = report
                    .raw_data
                    .iter()
                    .map(|group| match &group.outcome {
                        RawDataStatus::Merged(stats) => stats.copied,
                        _ => 0,
                    })
                    .sum();
                self.emit_event(ExecutionEvent::PrepareCompleted {
                    created_dirs: report.created_dirs.len(),
                    merged_files,
                    warnings: report.warnings.clone(),
                });
                result.prepare = Some(report);
            }
            Err(e) => return self.abort(result, pipeline, 0, e.into()),
        }

        let plans = match self.plan_steps(pipeline, ctx) {
            Ok(plans) => plans,
            Err(e) => return self.abort(result, pipeline, 0, e.into()),
        };

        result.status = ExecutionStatus::Executing;
        let total = pipeline.enabled_steps().count();
        let mut position = 0;

        for (index, (instance, plan)) in pipeline.steps.iter().zip(plans).enumerate() {
            let Some(plan) = plan else {
                info!("Skipping disabled step {}", instance.id);
                self.skip(&mut result, &instance.id, SkipReason::Disabled);
                continue;
            };
            position += 1;

            if let Err(violation) = sandbox::check(&instance.id, &plan.resolved, ctx) {
                let message = violation.to_string();
                result.steps.push(StepRecord {
                    step_id: instance.id.clone(),
                    status: StepStatus::Failed,
                    exit_code: None,
                    log_path: None,
                    duration: Duration::ZERO,
                    skip_reason: None,
                    command: Some(plan.invocation.command.clone()),
                    error: Some(message.clone()),
                });
                self.emit_event(ExecutionEvent::StepFailed {
                    step_id: instance.id.clone(),
                    error: message,
                });
                return self.abort(result, pipeline, index + 1, violation);
            }

            self.emit_event(ExecutionEvent::StepStarted {
                step_id: instance.id.clone(),
                position,
                total,
            });
            if ctx.dry_run {
                self.emit_event(ExecutionEvent::DryRunCommand {
                    step_id: instance.id.clone(),
                    command: plan.invocation.display_command(),
                });
            }

            let record = self.executor.execute(&plan, ctx).await;
            match record.status {
                StepStatus::Failed => {
                    let message = record
                        .error
                        .clone()
                        .unwrap_or_else(|| "step failed".to_string());
                    let failure = PipelineError::StepExecution {
                        step_id: instance.id.clone(),
                        exit_code: record.exit_code,
                        log_path: plan.invocation.log_path.clone(),
                        message: message.clone(),
                    };
                    result.steps.push(record);
                    self.emit_event(ExecutionEvent::StepFailed {
                        step_id: instance.id.clone(),
                        error: message,
                    });
                    return self.abort(result, pipeline, index + 1, failure);
                }
                _ => {
                    self.emit_event(ExecutionEvent::StepCompleted {
                        step_id: instance.id.clone(),
                        duration: record.duration,
                    });
                    result.steps.push(record);
                }
            }
        }

        result.complete();
        info!("Pipeline execution finished: {} - {:?}", pipeline.name, result.status);
        self.emit_event(ExecutionEvent::PipelineCompleted {
            execution_id: result.execution_id,
            status: result.status,
        });
        result
    }

    fn skip(&self, result: &mut PipelineResult, step_id: &str, reason: SkipReason) {
        result.steps.push(StepRecord::skipped(step_id, reason));
        self.emit_event(ExecutionEvent::StepSkipped {
            step_id: step_id.to_string(),
            reason,
        });
    }

    /// Fail the run, recording every step from `from` on as skipped
    fn abort(&self, mut result: PipelineResult, pipeline: &Pipeline, from: usize, failure: PipelineError) -> PipelineResult {
        error!("Pipeline {} failed: {}", pipeline.name, failure);

        for instance in pipeline.steps.iter().skip(from) {
            let reason = if instance.enabled {
                SkipReason::NotReached
            } else {
                SkipReason::Disabled
            };
            self.skip(&mut result, &instance.id, reason);
        }

        result.fail(&failure);
        self.emit_event(ExecutionEvent::PipelineCompleted {
            execution_id: result.execution_id,
            status: result.status,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, CommandOutcome, Invocation};
    use crate::core::{FailureCategory, PipelineConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records invocations; exit codes are scripted per step id
    #[derive(Default)]
    struct MockRunner {
        exit_codes: HashMap<String, i32>,
        calls: Mutex<Vec<String>>,
    }

    impl MockRunner {
        fn failing(step_id: &str, code: i32) -> Self {
            let mut runner = Self::default();
            runner.exit_codes.insert(step_id.to_string(), code);
            runner
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome, CommandError> {
            self.calls.lock().unwrap().push(invocation.step_id.clone());
            Ok(CommandOutcome {
                exit_code: self.exit_codes.get(&invocation.step_id).copied().unwrap_or(0),
            })
        }
    }

    fn context(root: &std::path::Path, dry_run: bool) -> RunContext {
        RunContext {
            root_dir: root.to_path_buf(),
            config_dir: root.join("configs"),
            datapool_root: root.join("dp"),
            run_id: "r1".to_string(),
            work_dir: root.join(".llmrunner"),
            run_dir: root.join(".llmrunner/runs/r1"),
            log_dir: root.join(".llmrunner/runs/r1/logs"),
            dry_run,
            allow_external_paths: false,
        }
    }

    fn pipeline(yaml: &str, ctx: &RunContext) -> Pipeline {
        PipelineConfig::from_yaml(yaml)
            .unwrap()
            .to_pipeline(&ctx.config_dir)
            .unwrap()
    }

    const THREE_STEPS: &str = r#"
variables:
  SCRIPT: "true"
steps:
  - id: eval_0
    type: eval
  - id: eval_1
    type: eval
  - id: eval_2
    type: eval
"#;

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let engine = ExecutionEngine::new(MockRunner::default());

        let result = engine.execute(&pipeline(THREE_STEPS, &ctx), &ctx).await;

        assert_eq!(result.status, ExecutionStatus::Done);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(engine.runner().calls(), vec!["eval_0", "eval_1", "eval_2"]);
        assert_eq!(result.count(StepStatus::Success), 3);
        assert!(result.prepare.is_some());
    }

    #[tokio::test]
    async fn test_failure_stops_run() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let engine = ExecutionEngine::new(MockRunner::failing("eval_1", 1));

        let result = engine.execute(&pipeline(THREE_STEPS, &ctx), &ctx).await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code(), FailureCategory::StepExecution.exit_code());
        assert_eq!(engine.runner().calls(), vec!["eval_0", "eval_1"]);

        let failed = result.step("eval_1").unwrap();
        assert_eq!(failed.status, StepStatus::Failed);
        assert_eq!(failed.exit_code, Some(1));
        assert_eq!(failed.log_path, Some(ctx.log_path("eval_1")));

        let skipped = result.step("eval_2").unwrap();
        assert_eq!(skipped.status, StepStatus::Skipped);
        assert_eq!(skipped.skip_reason, Some(SkipReason::NotReached));
        assert_eq!(result.failure.as_ref().unwrap().step_id.as_deref(), Some("eval_1"));
    }

    #[tokio::test]
    async fn test_disabled_step_is_skipped() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let yaml = "variables:\n  SCRIPT: \"true\"\nsteps:\n  - id: eval_0\n    type: eval\n    enabled: false\n  - id: eval_1\n    type: eval\n";
        let engine = ExecutionEngine::new(MockRunner::default());

        let result = engine.execute(&pipeline(yaml, &ctx), &ctx).await;

        assert!(result.is_success());
        assert_eq!(engine.runner().calls(), vec!["eval_1"]);
        assert_eq!(result.step("eval_0").unwrap().skip_reason, Some(SkipReason::Disabled));
    }

    #[tokio::test]
    async fn test_dry_run_invokes_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), true);
        let mut engine = ExecutionEngine::new(MockRunner::default());
        let commands = Arc::new(Mutex::new(Vec::new()));
        let seen = commands.clone();
        engine.add_event_handler(move |event| {
            if let ExecutionEvent::DryRunCommand { command, .. } = event {
                seen.lock().unwrap().push(command);
            }
        });

        let result = engine.execute(&pipeline(THREE_STEPS, &ctx), &ctx).await;

        assert!(result.is_success());
        assert!(engine.runner().calls().is_empty());
        assert_eq!(commands.lock().unwrap().len(), 3);
        assert!(commands.lock().unwrap()[0].ends_with("&& true)"));
        assert!(!ctx.datapool_root.exists());
        assert!(!ctx.run_dir.exists());
    }

    #[tokio::test]
    async fn test_sandbox_violation_fails_before_launch() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let yaml = "variables:\n  SCRIPT: \"true\"\nsteps:\n  - eval\n  - id: eval_1\n    type: eval\n    enabled: false\n";
        let mut pipeline = pipeline(yaml, &ctx);
        pipeline.apply_overrides(&[("OUTPUT_DIR".to_string(), "/tmp/outside".to_string())].into());
        let engine = ExecutionEngine::new(MockRunner::default());

        let result = engine.execute(&pipeline, &ctx).await;

        assert_eq!(result.exit_code(), FailureCategory::PathSandbox.exit_code());
        assert!(engine.runner().calls().is_empty());
        assert_eq!(result.step("eval_0").unwrap().status, StepStatus::Failed);
        assert_eq!(result.step("eval_1").unwrap().skip_reason, Some(SkipReason::Disabled));
    }

    #[test]
    fn test_validate_reports_sandbox_violation() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let mut pipeline = pipeline(THREE_STEPS, &ctx);
        let engine = ExecutionEngine::new(MockRunner::default());
        assert_eq!(engine.validate(&pipeline, &ctx).unwrap().len(), 3);

        pipeline.apply_overrides(&[("OUTPUT_DIR".to_string(), "/tmp/outside".to_string())].into());
        let error = engine.validate(&pipeline, &ctx).unwrap_err();
        assert_eq!(error.category(), FailureCategory::PathSandbox);
        assert!(engine.runner().calls().is_empty());
        assert!(!ctx.datapool_root.exists());
    }

    #[tokio::test]
    async fn test_configuration_error_before_any_step() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let yaml = "variables:\n  SCRIPT: \"true\"\n  A: \"${B}\"\n  B: \"${A}\"\nsteps:\n  - eval\n";
        let engine = ExecutionEngine::new(MockRunner::default());

        let result = engine.execute(&pipeline(yaml, &ctx), &ctx).await;

        assert_eq!(result.exit_code(), FailureCategory::Configuration.exit_code());
        assert!(engine.runner().calls().is_empty());
        assert_eq!(result.step("eval_0").unwrap().skip_reason, Some(SkipReason::NotReached));
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let temp = tempfile::tempdir().unwrap();
        let ctx = context(temp.path(), false);
        let mut engine = ExecutionEngine::new(MockRunner::failing("eval_0", 3));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_event_handler(move |event| {
            let name = match event {
                ExecutionEvent::PipelineStarted { .. } => "started",
                ExecutionEvent::PrepareCompleted { .. } => "prepared",
                ExecutionEvent::StepStarted { .. } => "step",
                ExecutionEvent::DryRunCommand { .. } => "dry",
                ExecutionEvent::StepSkipped { .. } => "skipped",
                ExecutionEvent::StepCompleted { .. } => "completed",
                ExecutionEvent::StepFailed { .. } => "failed",
                ExecutionEvent::PipelineCompleted { .. } => "done",
            };
            sink.lock().unwrap().push(name);
        });

        engine.execute(&pipeline(THREE_STEPS, &ctx), &ctx).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["started", "prepared", "step", "failed", "skipped", "skipped", "done"]
        );
    }
}
