use anyhow::{Context, Result};
use llmrunner::cli::commands::{CloneCommand, RunCommand, StepsCommand, ValidateCommand};
use llmrunner::cli::output::*;
use llmrunner::cli::{Cli, Command};
use llmrunner::core::config::env_imports;
use llmrunner::core::context::absolutize;
use llmrunner::core::{
    ConfigError, ConfigMap, FailureCategory, Pipeline, PipelineError, RunContext, RunOptions, StepType,
};
use llmrunner::execution::{ExecutionEngine, StepPlan};
use llmrunner::prepare::clone::{clone_experiment, CloneOptions};
use llmrunner::prepare::{prepare, CopyMode, PrepareOptions};
use llmrunner::ShellRunner;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    init_logging(cli.verbose)?;

    // Execute command
    let exit_code = match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Clone(cmd) => clone(cmd)?,
        Command::Steps(cmd) => list_steps(cmd)?,
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// `RUST_LOG` wins when set; otherwise DEBUG with `--verbose`, else INFO
fn init_logging(verbose: bool) -> Result<()> {
    let builder = FmtSubscriber::builder().with_writer(std::io::stderr);
    let installed = match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish()),
        Err(_) => {
            let log_level = if verbose { Level::DEBUG } else { Level::INFO };
            tracing::subscriber::set_global_default(builder.with_max_level(log_level).finish())
        }
    };
    installed.context("Failed to set logging subscriber")
}

/// Load a pipeline, layer environment imports and CLI overrides over its
/// variables, then build the run context
fn load_run(
    config: &Path,
    root: Option<&Path>,
    overrides: &ConfigMap,
    options: RunOptions,
) -> Result<(Pipeline, RunContext), ConfigError> {
    let mut pipeline = Pipeline::load(config)?;
    let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    pipeline.config_dir = absolutize(&cwd, &pipeline.config_dir);
    pipeline.apply_overrides(&env_imports(|key| std::env::var(key).ok()));
    pipeline.apply_overrides(overrides);

    let root_dir = match root {
        Some(root) => root.to_path_buf(),
        None => pipeline
            .variables
            .get("ROOT")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(cwd),
    };
    let options = RunOptions {
        root_dir,
        config_dir: pipeline.config_dir.clone(),
        ..options
    };
    let ctx = RunContext::from_config(&pipeline.variables, &options)?;
    Ok((pipeline, ctx))
}

fn configuration_failure(error: &ConfigError) -> i32 {
    println!("{} Configuration error:", CROSS);
    println!("  {}", style(error).red());
    FailureCategory::Configuration.exit_code()
}

async fn run_pipeline(cmd: &RunCommand) -> Result<i32> {
    let options = RunOptions {
        run_id: cmd.run_id.clone(),
        dry_run: cmd.dry_run,
        allow_external_paths: cmd.allow_external_paths,
        ..Default::default()
    };
    let (pipeline, ctx) = match load_run(&cmd.config, cmd.root.as_deref(), &cmd.overrides(), options) {
        Ok(loaded) => loaded,
        Err(e) => return Ok(configuration_failure(&e)),
    };

    println!("{} Loaded pipeline: {}", INFO, style(&pipeline.name).bold());
    for (key, value) in &cmd.variables {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let prepare_options = PrepareOptions { mode: cmd.copy_mode() };

    if cmd.prepare_only {
        return match prepare(&pipeline, &ctx, &prepare_options) {
            Ok(report) => {
                println!("{}", format_prepare_report(&report));
                for warning in &report.warnings {
                    println!("{} {}", WARN, style(warning).yellow());
                }
                if cmd.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Ok(0)
            }
            Err(e) => {
                let failure = PipelineError::from(e);
                println!("{} {}", CROSS, style(&failure).red());
                Ok(failure.category().exit_code())
            }
        };
    }

    // Create execution engine
    let mut engine = ExecutionEngine::new(ShellRunner::new()).with_prepare_options(prepare_options);

    // Set up event handler for console output
    engine.add_event_handler(move |event| {
        println!("{}", format_execution_event(&event));
    });

    // Execute pipeline
    println!();
    let result = engine.execute(&pipeline, &ctx).await;

    println!();
    for record in &result.steps {
        println!("  {}", format_step_record(record));
    }

    if !ctx.dry_run {
        let report_path = ctx.report_path();
        match result.write_report(&report_path) {
            Ok(()) => info!("Run report written to {}", report_path.display()),
            Err(e) => warn!("Failed to write run report {}: {}", report_path.display(), e),
        }
    }

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    // Print final status
    if result.is_success() {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&pipeline.name).bold(),
            style("successfully").green()
        );
    } else {
        println!(
            "\n{} {} {}",
            CROSS,
            style(&pipeline.name).bold(),
            style("failed").red()
        );
        if let Some(failure) = &result.failure {
            error!("{}", failure.message);
        }
    }

    Ok(result.exit_code())
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<i32> {
    if !cmd.json {
        println!("{} Validating pipeline...", INFO);
    }

    let loaded = load_run(&cmd.config, cmd.root.as_deref(), &cmd.overrides(), RunOptions {
        dry_run: true,
        ..Default::default()
    });
    let (pipeline, ctx) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => return Ok(configuration_failure(&e)),
    };

    let engine = ExecutionEngine::new(ShellRunner::new());
    let plans = match engine.validate(&pipeline, &ctx) {
        Ok(plans) => plans,
        Err(PipelineError::Configuration(e)) => return Ok(configuration_failure(&e)),
        Err(e) => {
            println!("{} {}", CROSS, style(&e).red());
            return Ok(e.category().exit_code());
        }
    };

    if cmd.json {
        let steps: Vec<_> = pipeline
            .steps
            .iter()
            .zip(&plans)
            .map(|(instance, plan)| plan_json(instance, plan.as_ref()))
            .collect();
        let data = serde_json::json!({
            "name": pipeline.name,
            "datapool_root": ctx.datapool_root,
            "steps": steps,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(0);
    }

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&pipeline.name).bold());
    println!("  Datapool: {}", style(ctx.datapool_root.display()).cyan());
    println!("  Steps: {}", style(pipeline.steps.len()).cyan());
    for (instance, plan) in pipeline.steps.iter().zip(&plans) {
        match plan {
            Some(plan) => println!(
                "  {} {} {}",
                style(format!("{:>2}.", instance.position + 1)).dim(),
                style(&instance.id).bold(),
                style(plan.invocation.display_command()).dim()
            ),
            None => println!(
                "  {} {} {}",
                style(format!("{:>2}.", instance.position + 1)).dim(),
                style(&instance.id).dim(),
                style("(disabled)").dim()
            ),
        }
    }
    Ok(0)
}

fn plan_json(instance: &llmrunner::StepInstance, plan: Option<&StepPlan>) -> serde_json::Value {
    match plan {
        Some(plan) => serde_json::json!({
            "id": instance.id,
            "type": instance.step_type,
            "enabled": true,
            "command": plan.invocation.command,
            "cwd": plan.invocation.cwd,
            "env": plan.invocation.env,
        }),
        None => serde_json::json!({
            "id": instance.id,
            "type": instance.step_type,
            "enabled": false,
        }),
    }
}

fn clone(cmd: &CloneCommand) -> Result<i32> {
    let root = match &cmd.root {
        Some(root) => root.clone(),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    let options = CloneOptions {
        copy_datapool: cmd.copy_datapool,
        mode: if cmd.link { CopyMode::Link } else { CopyMode::Copy },
    };

    match clone_experiment(&root, &cmd.source, &cmd.target, &options) {
        Ok(report) => {
            println!(
                "{} Cloned {} -> {}",
                CHECK,
                style(&cmd.source).bold(),
                style(&cmd.target).bold()
            );
            println!("  Config: {}", style(report.config_dir.display()).cyan());
            println!("  Datapool: {}", style(report.datapool_root.display()).cyan());
            for path in &report.rewritten {
                println!("  Rewrote {}", style(path.display()).dim());
            }
            for path in &report.skipped {
                println!("{} {} already exists, left alone", WARN, path.display());
            }
            Ok(0)
        }
        Err(e) => {
            println!("{} Clone failed:", CROSS);
            println!("  {}", style(&e).red());
            Ok(e.category().exit_code())
        }
    }
}

fn list_steps(cmd: &StepsCommand) -> Result<i32> {
    if cmd.json {
        let steps: Vec<_> = StepType::ALL
            .iter()
            .map(|step_type| {
                let defaults: ConfigMap = step_type.defaults().into_iter().collect();
                serde_json::json!({
                    "type": step_type,
                    "required": step_type.required_keys(),
                    "defaults": defaults,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&steps)?);
        return Ok(0);
    }

    for step_type in StepType::ALL {
        println!("{}", style(step_type).bold());
        println!("  required: {}", step_type.required_keys().join(", "));
        for (key, value) in step_type.defaults() {
            println!("  {} = {}", style(key).cyan(), style(value).dim());
        }
    }
    Ok(0)
}
