//! Run context - process-wide values of a single pipeline invocation

use crate::core::config::{is_truthy, ConfigMap};
use crate::core::error::ConfigError;
use crate::core::resolver::resolve_global;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Options a caller supplies when building a [`RunContext`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Repository root; relative paths are taken against it
    pub root_dir: PathBuf,

    /// Directory holding the pipeline file and its `steps/` configs
    pub config_dir: PathBuf,

    /// Explicit run identifier, overriding `RUN_ID`
    pub run_id: Option<String>,

    pub dry_run: bool,

    pub allow_external_paths: bool,
}

/// Immutable context of one pipeline run
///
/// Built once from the resolved pipeline variables and passed explicitly to
/// every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub root_dir: PathBuf,
    pub config_dir: PathBuf,
    /// Sandbox root all step inputs and outputs must live under
    pub datapool_root: PathBuf,
    pub run_id: String,
    /// Orchestrator work directory (`WORKDIR`)
    pub work_dir: PathBuf,
    /// Per-run directory under the work directory
    pub run_dir: PathBuf,
    /// Per-instance logs land here
    pub log_dir: PathBuf,
    pub dry_run: bool,
    pub allow_external_paths: bool,
}

impl RunContext {
    /// Build the context from the global pipeline variables
    pub fn from_config(global: &ConfigMap, options: &RunOptions) -> Result<Self, ConfigError> {
        let base = if options.root_dir.is_absolute() {
            PathBuf::new()
        } else {
            std::env::current_dir().map_err(|source| ConfigError::Io {
                path: PathBuf::from("."),
                source,
            })?
        };
        let root_dir = absolutize(&base, &options.root_dir);
        let config_dir = absolutize(&root_dir, &options.config_dir);

        let mut pinned = ConfigMap::new();
        pinned.insert("ROOT_DIR".to_string(), root_dir.display().to_string());
        pinned.insert("CONFIG_DIR".to_string(), config_dir.display().to_string());
        let resolved = resolve_global(global, &pinned)?;

        let non_empty = |key: &str| resolved.get(key).filter(|v| !v.trim().is_empty());

        let datapool_root = match non_empty("DATAPOOL_ROOT").or_else(|| non_empty("DATAPOOL")) {
            Some(path) => absolutize(&root_dir, Path::new(path)),
            None => root_dir.join("datapool"),
        };

        let run_id = options
            .run_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| non_empty("RUN_ID").map(str::to_string))
            .unwrap_or_else(default_run_id);

        let work_dir = absolutize(&root_dir, Path::new(non_empty("WORKDIR").unwrap_or(".llmrunner")));
        let run_dir = work_dir.join("runs").join(&run_id);
        let log_dir = run_dir.join("logs");

        Ok(Self {
            root_dir,
            config_dir,
            datapool_root,
            run_id,
            work_dir,
            run_dir,
            log_dir,
            dry_run: options.dry_run || is_truthy(resolved.get("DRY_RUN")),
            allow_external_paths: options.allow_external_paths
                || is_truthy(resolved.get("ALLOW_EXTERNAL_PATHS")),
        })
    }

    /// Run values that take precedence over every configuration layer
    pub fn pinned_variables(&self) -> ConfigMap {
        [
            ("ROOT_DIR", self.root_dir.display().to_string()),
            ("CONFIG_DIR", self.config_dir.display().to_string()),
            ("DATAPOOL_ROOT", self.datapool_root.display().to_string()),
            ("RUN_ID", self.run_id.clone()),
            ("RUN_DIR", self.run_dir.display().to_string()),
            ("LOG_DIR", self.log_dir.display().to_string()),
            ("WORKDIR", self.work_dir.display().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Log file of a step instance
    pub fn log_path(&self, step_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", step_id))
    }

    /// Where the run report is written
    pub fn report_path(&self) -> PathBuf {
        self.run_dir.join("report.json")
    }

    /// Resolve a possibly relative path against the root directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        absolutize(&self.root_dir, Path::new(path))
    }
}

/// Timestamp run identifier, `YYYYmmdd-HHMMSS`
pub fn default_run_id() -> String {
    chrono::Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Join `path` onto `base` unless absolute, then normalize lexically
///
/// `.` components are dropped and `..` pops the previous component. Nothing
/// is looked up on disk, so paths that do not exist yet work too.
pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(root: &str) -> RunOptions {
        RunOptions {
            root_dir: PathBuf::from(root),
            config_dir: PathBuf::from("configs/experiments/exp1"),
            run_id: Some("r1".to_string()),
            dry_run: false,
            allow_external_paths: false,
        }
    }

    fn vars(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_absolutize() {
        let base = Path::new("/repo");
        assert_eq!(absolutize(base, Path::new("a/./b/../c")), PathBuf::from("/repo/a/c"));
        assert_eq!(absolutize(base, Path::new("/dp/../etc")), PathBuf::from("/etc"));
        assert_eq!(absolutize(base, Path::new("../x")), PathBuf::from("/x"));
    }

    #[test]
    fn test_context_from_config() {
        let global = vars(&[
            ("DATAPOOL_ROOT", "${ROOT_DIR}/datapool/experiments/exp1"),
            ("WORKDIR", ".runs"),
        ]);
        let ctx = RunContext::from_config(&global, &options("/repo")).unwrap();

        assert_eq!(ctx.datapool_root, PathBuf::from("/repo/datapool/experiments/exp1"));
        assert_eq!(ctx.config_dir, PathBuf::from("/repo/configs/experiments/exp1"));
        assert_eq!(ctx.run_dir, PathBuf::from("/repo/.runs/runs/r1"));
        assert_eq!(ctx.log_path("eval_0"), PathBuf::from("/repo/.runs/runs/r1/logs/eval_0.log"));
        assert!(!ctx.dry_run);
    }

    #[test]
    fn test_defaults_and_flags_from_config() {
        let global = vars(&[("DRY_RUN", "1"), ("ALLOW_EXTERNAL_PATHS", "yes"), ("RUN_ID", "nightly")]);
        let mut opts = options("/repo");
        opts.run_id = None;
        let ctx = RunContext::from_config(&global, &opts).unwrap();

        assert_eq!(ctx.datapool_root, PathBuf::from("/repo/datapool"));
        assert_eq!(ctx.work_dir, PathBuf::from("/repo/.llmrunner"));
        assert_eq!(ctx.run_id, "nightly");
        assert!(ctx.dry_run);
        assert!(ctx.allow_external_paths);
    }

    #[test]
    fn test_root_dir_is_absolutized() {
        let ctx = RunContext::from_config(&ConfigMap::new(), &options("/repo/sub/..")).unwrap();
        assert_eq!(ctx.root_dir, PathBuf::from("/repo"));

        let ctx = RunContext::from_config(&ConfigMap::new(), &options("repo")).unwrap();
        assert!(ctx.root_dir.is_absolute());
        assert_eq!(ctx.root_dir, std::env::current_dir().unwrap().join("repo"));
    }

    #[test]
    fn test_datapool_env_fallback() {
        let global = vars(&[("DATAPOOL", "/mnt/pool")]);
        let ctx = RunContext::from_config(&global, &options("/repo")).unwrap();
        assert_eq!(ctx.datapool_root, PathBuf::from("/mnt/pool"));
    }

    #[test]
    fn test_pinned_variables() {
        let ctx = RunContext::from_config(&vars(&[("DATAPOOL_ROOT", "/dp")]), &options("/repo")).unwrap();
        let pinned = ctx.pinned_variables();
        assert_eq!(pinned["DATAPOOL_ROOT"], "/dp");
        assert_eq!(pinned["RUN_ID"], "r1");
        assert_eq!(pinned["ROOT_DIR"], "/repo");
    }

    #[test]
    fn test_default_run_id_shape() {
        let id = default_run_id();
        assert_eq!(id.len(), 15);
        assert_eq!(id.as_bytes()[8], b'-');
    }
}
