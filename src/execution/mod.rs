//! Pipeline execution engine

pub mod engine;
pub mod executor;
pub mod sandbox;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{plan_step, StepExecutor, StepPlan};
