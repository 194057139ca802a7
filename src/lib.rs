//! llmrunner - step orchestrator for LLM training pipelines

pub mod cli;
pub mod command;
pub mod core;
pub mod execution;
pub mod prepare;

// Re-export commonly used types
pub use command::{CommandOutcome, CommandRunner, Invocation, ShellRunner};
pub use core::{ExecutionStatus, Pipeline, PipelineConfig, PipelineResult, RunContext, RunOptions, StepInstance};
pub use execution::{ExecutionEngine, ExecutionEvent};
pub use prepare::{prepare, PrepareOptions, PrepareReport};
