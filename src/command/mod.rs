//! Step command capability
//!
//! The engine knows nothing about what a step does. It hands an
//! [`Invocation`] to a [`CommandRunner`] and gets an exit code back, with the
//! runner responsible for streaming output into the step's log.

pub mod shell;

pub use shell::ShellRunner;

use crate::core::EnvironmentMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Error types for command execution
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Everything needed to start one step process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub step_id: String,
    /// Shell command line
    pub command: String,
    /// Working directory
    pub cwd: PathBuf,
    /// Variables added to the inherited process environment
    pub env: EnvironmentMap,
    /// stdout and stderr are appended here
    pub log_path: PathBuf,
}

impl Invocation {
    /// Human-readable form, as printed in dry-run mode
    pub fn display_command(&self) -> String {
        format!("(cd {} && {})", self.cwd.display(), self.command)
    }
}

/// Result of a finished step process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// Process exit code; -1 when the process was terminated by a signal
    pub exit_code: i32,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capability to run a step command to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the command and wait for it to exit
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutcome, CommandError>;
}
