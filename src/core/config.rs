//! Pipeline and step configuration from YAML

use crate::core::error::ConfigError;
use crate::core::pipeline::Pipeline;
use crate::core::step::{IdPolicy, RawStep, StepType};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Flat variable mapping, ordered by key
pub type ConfigMap = BTreeMap<String, String>;

/// Process environment variables that override pipeline variables when set
pub const ENV_IMPORT_KEYS: &[&str] = &[
    "DATAPOOL",
    "ROOT",
    "BASE_MODEL_SRC",
    "MINDSPEED",
    "MINDSPEED_LLM",
    "CPT_RAW_COPY_SRC",
    "SFT_RAW_COPY_SRC",
];

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name
    #[serde(default)]
    pub name: Option<String>,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Files whose variables are merged underneath this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// How explicit step id suffixes are checked
    #[serde(default)]
    pub id_policy: IdPolicy,

    /// Global variables available to all steps
    #[serde(default)]
    variables: BTreeMap<String, Value>,

    /// Declared step list; when absent, `STEP_<TYPE>_ENABLED` variables are used
    #[serde(default)]
    pub steps: Option<Vec<RawStep>>,
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file, following includes
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut stack = Vec::new();
        Self::load_with_includes(path.as_ref(), &mut stack)
    }

    /// Parse pipeline configuration from a YAML string
    ///
    /// Includes are not followed since there is no file to resolve them against.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::parse(yaml, Path::new("<inline>"))
    }

    fn parse(yaml: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate(origin)?;
        Ok(config)
    }

    fn load_with_includes(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Self, ConfigError> {
        let canonical = path
            .canonicalize()
            .map_err(|_| ConfigError::ConfigFileNotFound(path.to_path_buf()))?;
        if stack.contains(&canonical) {
            return Err(ConfigError::IncludeCycle(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content, path)?;

        if config.include.is_empty() {
            return Ok(config);
        }

        stack.push(canonical);
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut merged = BTreeMap::new();
        for include in &config.include {
            let included = Self::load_with_includes(&base_dir.join(include), stack)?;
            merged.extend(included.variables);
        }
        stack.pop();

        merged.append(&mut config.variables);
        config.variables = merged;
        Ok(config)
    }

    /// Validate the pipeline configuration
    fn validate(&self, origin: &Path) -> Result<(), ConfigError> {
        for (key, value) in &self.variables {
            if scalar_to_string(value).is_none() {
                return Err(ConfigError::Parse {
                    path: origin.to_path_buf(),
                    message: format!("variable '{}' must be a scalar value", key),
                });
            }
        }

        // Catch duplicate ids early when every entry spells its id out
        if let Some(steps) = &self.steps {
            let mut seen_ids = HashSet::new();
            for step in steps {
                if let RawStep::Descriptor(d) = step {
                    if let Some(id) = &d.id {
                        if !seen_ids.insert(id) {
                            return Err(ConfigError::DuplicateId(id.clone()));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Pipeline name, falling back to the given default
    pub fn name_or(&self, default: &str) -> String {
        self.name.clone().unwrap_or_else(|| default.to_string())
    }

    /// Global variables as strings
    pub fn variables(&self) -> ConfigMap {
        self.variables
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect()
    }

    /// Set or replace a global variable
    pub fn set_variable(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), Value::String(value.into()));
    }

    /// The declared step list, or the legacy flag-based one
    pub fn raw_steps(&self) -> Vec<RawStep> {
        match &self.steps {
            Some(steps) => steps.clone(),
            None => legacy_steps(&self.variables()),
        }
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self, config_dir: impl Into<PathBuf>) -> Result<Pipeline, ConfigError> {
        Pipeline::from_config(self, config_dir.into())
    }
}

/// Step list derived from `STEP_<TYPE>_ENABLED` flags, in registry order
pub fn legacy_steps(variables: &ConfigMap) -> Vec<RawStep> {
    StepType::ALL
        .iter()
        .filter(|t| {
            let key = format!("STEP_{}_ENABLED", t.as_str().to_uppercase());
            is_truthy(variables.get(&key).map(String::as_str))
        })
        .map(|t| RawStep::Name(t.as_str().to_string()))
        .collect()
}

/// Load a per-step config file: a YAML mapping of scalar values
pub fn load_step_config(path: &Path) -> Result<ConfigMap, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::ConfigFileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_step_config(&content, path)
}

/// Parse per-step config text; `origin` is only used in error messages
pub fn parse_step_config(yaml: &str, origin: &Path) -> Result<ConfigMap, ConfigError> {
    let parse_error = |message: String| ConfigError::Parse {
        path: origin.to_path_buf(),
        message,
    };

    let value: Value = serde_yaml::from_str(yaml).map_err(|e| parse_error(e.to_string()))?;
    let mapping = match value {
        Value::Null => return Ok(ConfigMap::new()),
        Value::Mapping(mapping) => mapping,
        _ => return Err(parse_error("expected a mapping of variables".to_string())),
    };

    let mut config = ConfigMap::new();
    for (key, value) in mapping {
        let key = match key {
            Value::String(s) => s,
            other => return Err(parse_error(format!("non-string key {:?}", other))),
        };
        let value = scalar_to_string(&value)
            .ok_or_else(|| parse_error(format!("variable '{}' must be a scalar value", key)))?;
        config.insert(key, value);
    }
    Ok(config)
}

/// Render a scalar YAML value as a variable string
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse a boolean flag: `1/true/yes/on` or `0/false/no/off/""`
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Whether an optional flag value is set to a true value
pub fn is_truthy(value: Option<&str>) -> bool {
    value.and_then(parse_flag).unwrap_or(false)
}

/// Collect [`ENV_IMPORT_KEYS`] through `lookup`, skipping unset and empty ones
pub fn env_imports<F>(lookup: F) -> ConfigMap
where
    F: Fn(&str) -> Option<String>,
{
    ENV_IMPORT_KEYS
        .iter()
        .filter_map(|key| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v))
        })
        .collect()
}
