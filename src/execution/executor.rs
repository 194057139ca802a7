//! Step executor - plans and runs individual step instances

use crate::{
    command::{CommandRunner, Invocation},
    core::{
        config::is_truthy, project, ConfigError, Pipeline, ResolvedConfig, RunContext, StepInstance, StepRecord,
        StepStatus,
    },
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, error, info, warn};

/// Everything decided about a step instance before it runs
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub instance: StepInstance,
    pub resolved: ResolvedConfig,
    pub invocation: Invocation,
    /// Output directory emptied before the step runs (`CLEAR_OUTPUT`)
    pub clear_output: Option<PathBuf>,
}

impl StepPlan {
    pub fn step_id(&self) -> &str {
        &self.instance.id
    }
}

/// Resolve, project and build the command line of one instance
pub fn plan_step(pipeline: &Pipeline, instance: &StepInstance, ctx: &RunContext) -> Result<StepPlan, ConfigError> {
    let resolved = pipeline.resolve_step(instance, ctx)?;
    let env = project(instance, &resolved, ctx);

    let command = resolved
        .get("SCRIPT")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingRequiredKey {
            step: instance.id.clone(),
            key: "SCRIPT".to_string(),
        })?;

    let cwd = match resolved.get("SCRIPT_CWD").map(str::trim).filter(|s| !s.is_empty()) {
        Some(dir) => ctx.resolve_path(dir),
        None => ctx.root_dir.clone(),
    };

    let clear_output = if is_truthy(resolved.get("CLEAR_OUTPUT")) {
        clear_target(instance, &resolved, ctx)
    } else {
        None
    };

    Ok(StepPlan {
        invocation: Invocation {
            step_id: instance.id.clone(),
            command,
            cwd,
            env,
            log_path: ctx.log_path(&instance.id),
        },
        instance: instance.clone(),
        resolved,
        clear_output,
    })
}

/// Output directory to clear; only strictly inside the datapool
fn clear_target(instance: &StepInstance, resolved: &ResolvedConfig, ctx: &RunContext) -> Option<PathBuf> {
    let dir = instance.step_type.output_dir(resolved)?;
    let dir = ctx.resolve_path(&dir.to_string_lossy());
    if dir.starts_with(&ctx.datapool_root) && dir != ctx.datapool_root {
        Some(dir)
    } else {
        warn!(
            "{}: not clearing {}, it is not inside the datapool",
            instance.id,
            dir.display()
        );
        None
    }
}

/// Runs planned steps through a [`CommandRunner`]
pub struct StepExecutor<R> {
    runner: R,
}

impl<R: CommandRunner> StepExecutor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute a planned step and record the outcome
    pub async fn execute(&self, plan: &StepPlan, ctx: &RunContext) -> StepRecord {
        let invocation = &plan.invocation;
        let display_cmd = invocation.display_command();

        if ctx.dry_run {
            if let Some(dir) = &plan.clear_output {
                info!("[dry-run] would clear {}", dir.display());
            }
            info!("[dry-run] {}", display_cmd);
            return record(plan, StepStatus::Success, Some(0), None, Duration::ZERO, None);
        }

        if let Some(dir) = &plan.clear_output {
            if let Err(e) = clear_dir(dir).await {
                error!("{}: failed to clear {}: {}", plan.step_id(), dir.display(), e);
                let message = format!("failed to clear {}: {}", dir.display(), e);
                return record(plan, StepStatus::Failed, None, None, Duration::ZERO, Some(message));
            }
        }

        info!("Executing step: {}", plan.step_id());
        debug!("{}", display_cmd);

        let started = Instant::now();
        let outcome = self.runner.run(invocation).await;
        let elapsed = started.elapsed();
        let log_path = Some(invocation.log_path.clone());

        match outcome {
            Ok(outcome) if outcome.success() => {
                record(plan, StepStatus::Success, Some(outcome.exit_code), log_path, elapsed, None)
            }
            Ok(outcome) => {
                let message = format!("exit code {}", outcome.exit_code);
                record(plan, StepStatus::Failed, Some(outcome.exit_code), log_path, elapsed, Some(message))
            }
            Err(e) => {
                error!("Command error for step {}: {}", plan.step_id(), e);
                record(plan, StepStatus::Failed, None, log_path, elapsed, Some(e.to_string()))
            }
        }
    }
}

/// Empty an output directory, keeping the directory itself. A plain file at
/// the target is removed.
async fn clear_dir(target: &Path) -> std::io::Result<()> {
    let metadata = match fs::symlink_metadata(target).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.is_dir() {
        fs::remove_file(target).await?;
        info!("Removed {}", target.display());
        return Ok(());
    }

    let mut removed = 0usize;
    let mut entries = fs::read_dir(target).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        removed += 1;
    }
    if removed > 0 {
        info!("Cleared {} entries from {}", removed, target.display());
    }
    Ok(())
}

fn record(
    plan: &StepPlan,
    status: StepStatus,
    exit_code: Option<i32>,
    log_path: Option<PathBuf>,
    duration: Duration,
    error: Option<String>,
) -> StepRecord {
    StepRecord {
        step_id: plan.instance.id.clone(),
        status,
        exit_code,
        log_path,
        duration,
        skip_reason: None,
        command: Some(plan.invocation.command.clone()),
        error,
    }
}
