//! CLI output formatting

use crate::{
    core::{ExecutionStatus, SkipReason, StepRecord, StepStatus},
    execution::ExecutionEvent,
    prepare::PrepareReport,
};
use console::Emoji;
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Prepare => style("PREPARE").dim().to_string(),
        ExecutionStatus::Executing => style("EXECUTING").yellow().to_string(),
        ExecutionStatus::Done => style("DONE").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
    }
}

fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Disabled => "disabled",
        SkipReason::NotReached => "not reached",
    }
}

/// One summary line per step record
pub fn format_step_record(record: &StepRecord) -> String {
    match record.status {
        StepStatus::Success => format!(
            "{} {} {}",
            CHECK,
            style(&record.step_id).green(),
            style(format_duration(record.duration)).dim()
        ),
        StepStatus::Failed => {
            let exit = record
                .exit_code
                .map(|code| format!("exit {}", code))
                .unwrap_or_else(|| "no exit code".to_string());
            let mut line = format!("{} {} ({})", CROSS, style(&record.step_id).red(), exit);
            if let Some(log) = &record.log_path {
                line.push_str(&format!(" {}", style(log.display()).dim()));
            }
            line
        }
        StepStatus::Skipped => format!(
            "{} {} {}",
            SKIP,
            style(&record.step_id).dim(),
            style(record.skip_reason.map(skip_label).unwrap_or("skipped")).dim()
        ),
    }
}

/// Short human summary of the prepare phase
pub fn format_prepare_report(report: &PrepareReport) -> String {
    let verb = if report.dry_run { "would create" } else { "created" };
    format!(
        "{} Datapool {} ({} {} dirs, {} raw groups)",
        INFO,
        style(report.datapool_root.display()).bold(),
        verb,
        report.created_dirs.len(),
        report.raw_data.len()
    )
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            run_id,
            dry_run,
        } => format!(
            "{} Starting pipeline {} run {} ({}){}",
            ROCKET,
            style(pipeline_name).bold(),
            style(run_id).cyan(),
            style(&execution_id.to_string()[..8]).dim(),
            if *dry_run { " [dry-run]" } else { "" }
        ),
        ExecutionEvent::PrepareCompleted {
            created_dirs,
            merged_files,
            warnings,
        } => {
            let mut line = format!(
                "{} Prepared datapool: {} dirs, {} files staged",
                INFO, created_dirs, merged_files
            );
            for warning in warnings {
                line.push_str(&format!("\n{} {}", WARN, style(warning).yellow()));
            }
            line
        }
        ExecutionEvent::StepStarted {
            step_id,
            position,
            total,
        } => format!(
            "{} {} {}",
            SPINNER,
            style(step_id).cyan(),
            style(format!("[{}/{}]", position, total)).dim()
        ),
        ExecutionEvent::DryRunCommand { command, .. } => {
            format!("  {} {}", style("[dry-run]").yellow(), command)
        }
        ExecutionEvent::StepSkipped { step_id, reason } => format!(
            "{} {} ({})",
            SKIP,
            style(step_id).dim(),
            skip_label(*reason)
        ),
        ExecutionEvent::StepCompleted { step_id, duration } => format!(
            "{} {} {}",
            CHECK,
            style(step_id).green(),
            style(format_duration(*duration)).dim()
        ),
        ExecutionEvent::StepFailed { step_id, error } => {
            format!("{} {}: {}", CROSS, style(step_id).red(), style(error).dim())
        }
        ExecutionEvent::PipelineCompleted { execution_id, status } => {
            let status_str = match status {
                ExecutionStatus::Done => format!("{} completed", style("successfully").green()),
                ExecutionStatus::Failed => style("failed").red().to_string(),
                other => format_status(*other),
            };
            format!(
                "{} Pipeline ({}) {}",
                INFO,
                style(&execution_id.to_string()[..8]).dim(),
                status_str
            )
        }
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
