//! Pipeline domain model

use crate::core::{
    config::{load_step_config, ConfigMap, PipelineConfig},
    context::RunContext,
    error::ConfigError,
    resolver::{resolve, ResolvedConfig},
    step::{validate_steps, IdPolicy, StepInstance},
};
use std::path::{Path, PathBuf};

/// A validated pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Global variables available to all steps
    pub variables: ConfigMap,

    /// Step instances in execution order
    pub steps: Vec<StepInstance>,

    /// Directory step config paths are relative to
    pub config_dir: PathBuf,

    pub id_policy: IdPolicy,
}

impl Pipeline {
    /// Create a pipeline from configuration, validating its step list
    pub fn from_config(config: &PipelineConfig, config_dir: PathBuf) -> Result<Self, ConfigError> {
        let steps = validate_steps(&config.raw_steps(), config.id_policy)?;

        Ok(Pipeline {
            name: config.name_or("pipeline"),
            variables: config.variables(),
            steps,
            config_dir,
            id_policy: config.id_policy,
        })
    }

    /// Load and validate a pipeline file; its directory becomes the config directory
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = PipelineConfig::from_file(path)?;
        let config_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let mut pipeline = Self::from_config(&config, config_dir)?;
        if config.name.is_none() {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                pipeline.name = stem.to_string();
            }
        }
        Ok(pipeline)
    }

    /// Overlay variables, e.g. imported process environment or CLI overrides
    pub fn apply_overrides(&mut self, overrides: &ConfigMap) {
        for (key, value) in overrides {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps that will actually run
    pub fn enabled_steps(&self) -> impl Iterator<Item = &StepInstance> {
        self.steps.iter().filter(|s| s.enabled)
    }

    /// Config file of an instance: the declared one, else `steps/<id>.yaml` or
    /// `steps/<type>.yaml` when present
    pub fn config_file(&self, instance: &StepInstance) -> Option<PathBuf> {
        if let Some(path) = &instance.config_path {
            return Some(self.config_dir.join(path));
        }
        // `steps/<id>.yaml`, then the shared `steps/<type>.yaml`
        let steps_dir = self.config_dir.join("steps");
        [instance.id.as_str(), instance.step_type.as_str()]
            .into_iter()
            .flat_map(|stem| ["yaml", "yml"].map(|ext| steps_dir.join(format!("{}.{}", stem, ext))))
            .find(|candidate| candidate.is_file())
    }

    /// Load the per-instance config file, if the instance has one
    pub fn load_instance_config(&self, instance: &StepInstance) -> Result<Option<ConfigMap>, ConfigError> {
        self.config_file(instance)
            .map(|path| load_step_config(&path))
            .transpose()
    }

    /// Resolve the full configuration of one instance for a run
    pub fn resolve_step(&self, instance: &StepInstance, ctx: &RunContext) -> Result<ResolvedConfig, ConfigError> {
        let instance_config = self.load_instance_config(instance)?;
        resolve(
            &self.variables,
            instance,
            instance_config.as_ref(),
            &ctx.pinned_variables(),
        )
    }
}
