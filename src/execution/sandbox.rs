//! Path sandboxing of step inputs and outputs

use crate::core::{PipelineError, ResolvedConfig, RunContext};
use std::path::PathBuf;

const DIRECTION_PREFIXES: [&str; 4] = ["INPUT_", "OUTPUT_", "IN_", "OUT_"];
const PATH_SUFFIXES: [&str; 5] = ["_PATH", "_DIR", "_PREFIX", "_FILE", "_ROOT"];

/// Whether a config key names an input or output path, e.g. `OUTPUT_PREFIX`
pub fn is_sandboxed_key(key: &str) -> bool {
    DIRECTION_PREFIXES.iter().any(|p| key.starts_with(p))
        && PATH_SUFFIXES.iter().any(|s| key.ends_with(s))
}

/// Input/output path variables of a resolved config, made absolute
pub fn sandboxed_paths(resolved: &ResolvedConfig, ctx: &RunContext) -> Vec<(String, PathBuf)> {
    resolved
        .iter()
        .filter(|(key, value)| is_sandboxed_key(key) && !value.trim().is_empty())
        .map(|(key, value)| (key.clone(), ctx.resolve_path(value.trim())))
        .collect()
}

/// Fail if any input/output path escapes the datapool and the run directory
pub fn check(step_id: &str, resolved: &ResolvedConfig, ctx: &RunContext) -> Result<(), PipelineError> {
    if ctx.allow_external_paths {
        return Ok(());
    }

    for (key, path) in sandboxed_paths(resolved, ctx) {
        if !path.starts_with(&ctx.datapool_root) && !path.starts_with(&ctx.run_dir) {
            return Err(PipelineError::PathSandboxViolation {
                step_id: step_id.to_string(),
                key,
                path,
                datapool_root: ctx.datapool_root.clone(),
                run_dir: ctx.run_dir.clone(),
            });
        }
    }
    Ok(())
}
