//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{CloneCommand, RunCommand, StepsCommand, ValidateCommand};
use std::ffi::OsString;

/// Orchestrator for multi-stage LLM training pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "llmrunner")]
#[command(version = "0.1.0")]
#[command(about = "Runs LLM training pipelines built from external step scripts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate a pipeline and print its execution plan
    Validate(ValidateCommand),

    /// Clone an experiment's configs and scaffold its datapool
    Clone(CloneCommand),

    /// List step types with their required keys and defaults
    Steps(StepsCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "llmrunner",
            "run",
            "-c",
            "configs/exp/pipeline.yaml",
            "--dry-run",
            "--var",
            "MODEL_PREFIX=qwen",
            "--var",
            "SCRIPT=echo a=b",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Command::Run(cmd) => {
                assert_eq!(cmd.config, PathBuf::from("configs/exp/pipeline.yaml"));
                assert!(cmd.dry_run);
                assert!(!cmd.prepare_only);
                assert_eq!(cmd.overrides()["SCRIPT"], "echo a=b");
                assert_eq!(cmd.overrides()["MODEL_PREFIX"], "qwen");
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_clone() {
        let cli = Cli::try_parse_from(["llmrunner", "clone", "exp1", "exp2", "--copy-datapool"]).unwrap();
        match cli.command {
            Command::Clone(cmd) => {
                assert_eq!(cmd.source, "exp1");
                assert_eq!(cmd.target, "exp2");
                assert!(cmd.copy_datapool);
            }
            other => panic!("expected clone, got {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_config() {
        assert!(Cli::try_parse_from(["llmrunner", "run"]).is_err());
        assert!(Cli::try_parse_from(["llmrunner", "run", "-c", "p.yaml", "--var", "NOEQUALS"]).is_err());
    }
}
