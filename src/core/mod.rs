//! Core domain models for the orchestrator
//!
//! Step instances and their validation, layered configuration and its
//! resolution, the run context and the environment handed to step commands.

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod resolver;
pub mod state;
pub mod step;

pub use config::{ConfigMap, PipelineConfig};
pub use context::{RunContext, RunOptions};
pub use environment::{project, EnvironmentMap};
pub use error::{ConfigError, FailureCategory, PipelineError, PrepareError};
pub use pipeline::*;
pub use resolver::{resolve, ResolvedConfig};
pub use state::*;
pub use step::*;
