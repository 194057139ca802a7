//! CLI command definitions

use crate::core::ConfigMap;
use crate::prepare::CopyMode;
use clap::Args;
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Print the commands that would run without running or writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Stage the datapool and stop before the first step
    #[arg(long)]
    pub prepare_only: bool,

    /// Run identifier (default: current timestamp)
    #[arg(long)]
    pub run_id: Option<String>,

    /// Repository root (default: $ROOT, else the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Let step inputs and outputs point outside the datapool
    #[arg(long)]
    pub allow_external_paths: bool,

    /// Variable overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,

    /// Hard-link staged files instead of copying them
    #[arg(long)]
    pub link: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunCommand {
    pub fn overrides(&self) -> ConfigMap {
        self.variables.iter().cloned().collect()
    }

    pub fn copy_mode(&self) -> CopyMode {
        if self.link {
            CopyMode::Link
        } else {
            CopyMode::Copy
        }
    }
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Repository root (default: $ROOT, else the current directory)
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Variable overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ValidateCommand {
    pub fn overrides(&self) -> ConfigMap {
        self.variables.iter().cloned().collect()
    }
}

/// Clone an experiment
#[derive(Debug, Args, Clone)]
pub struct CloneCommand {
    /// Experiment to clone
    pub source: String,

    /// Name of the new experiment
    pub target: String,

    /// Repository root holding `configs/` and `datapool/`
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Also copy data, models and reports of the source datapool
    #[arg(long)]
    pub copy_datapool: bool,

    /// Hard-link copied datapool files
    #[arg(long)]
    pub link: bool,
}

/// List step types
#[derive(Debug, Args, Clone)]
pub struct StepsCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
