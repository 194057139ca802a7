//! Layered configuration resolution and `${VAR}` substitution
//!
//! Resolution is a pure function: layers are merged with later layers
//! overwriting whole keys, then every `${NAME}` that names a key of the merged
//! mapping is replaced by that key's resolved value. Names that are not in the
//! mapping are left untouched for the step script's own shell to expand.

use crate::core::config::ConfigMap;
use crate::core::error::ConfigError;
use crate::core::step::StepInstance;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Longest reference chain followed before giving up
pub const MAX_SUBSTITUTION_DEPTH: usize = 32;

/// Defaults shared by every step, below the type defaults
pub const COMMON_DEFAULTS: &[(&str, &str)] = &[
    ("WORKDIR", ".llmrunner"),
    ("MODEL_PREFIX", "model"),
    ("BASE_MODEL_NAME", "base_model"),
    ("BASE_MODEL_PATH", "${DATAPOOL_ROOT}/model/base/${BASE_MODEL_NAME}"),
    ("TOKENIZER_PATH", "${BASE_MODEL_PATH}"),
];

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Fully substituted configuration of one step (or of the pipeline itself)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResolvedConfig(ConfigMap);

impl ResolvedConfig {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &ConfigMap {
        &self.0
    }

    pub fn into_inner(self) -> ConfigMap {
        self.0
    }
}

/// Builder merging configuration layers in increasing precedence
#[derive(Debug, Clone, Default)]
pub struct ConfigLayers {
    merged: ConfigMap,
}

impl ConfigLayers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer; its keys overwrite those of every earlier layer
    pub fn layer<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in entries {
            self.merged.insert(key.into(), value.into());
        }
        self
    }

    /// The merged mapping before substitution
    pub fn merged(&self) -> &ConfigMap {
        &self.merged
    }

    /// Substitute placeholders in the merged mapping
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        substitute(&self.merged).map(ResolvedConfig)
    }
}

/// Replace every `${NAME}` naming a key of `map` with that key's resolved value
pub fn substitute(map: &ConfigMap) -> Result<ConfigMap, ConfigError> {
    let mut done = HashMap::new();
    let mut resolved = ConfigMap::new();
    for key in map.keys() {
        let mut stack = Vec::new();
        let value = resolve_key(key, map, &mut done, &mut stack)?;
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

fn resolve_key<'a>(
    key: &'a str,
    map: &'a ConfigMap,
    done: &mut HashMap<&'a str, String>,
    stack: &mut Vec<&'a str>,
) -> Result<String, ConfigError> {
    if let Some(value) = done.get(key) {
        return Ok(value.clone());
    }

    if let Some(start) = stack.iter().position(|k| *k == key) {
        let mut chain: Vec<String> = stack[start..].iter().map(|k| k.to_string()).collect();
        chain.push(key.to_string());
        return Err(ConfigError::CyclicSubstitution { chain });
    }
    if stack.len() >= MAX_SUBSTITUTION_DEPTH {
        let mut chain: Vec<String> = stack.iter().map(|k| k.to_string()).collect();
        chain.push(key.to_string());
        return Err(ConfigError::CyclicSubstitution { chain });
    }

    let raw = map.get(key).map(String::as_str).unwrap_or_default();
    stack.push(key);

    let mut value = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in placeholder_regex().captures_iter(raw) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        value.push_str(&raw[last..whole.start()]);
        match map.get_key_value(name.as_str()) {
            Some((referenced, _)) => {
                value.push_str(&resolve_key(referenced, map, done, stack)?);
            }
            None => value.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    value.push_str(&raw[last..]);

    stack.pop();
    done.insert(key, value.clone());
    Ok(value)
}

/// Resolve the pipeline-level configuration: common defaults, global, pinned
pub fn resolve_global(global: &ConfigMap, pinned: &ConfigMap) -> Result<ResolvedConfig, ConfigError> {
    ConfigLayers::new()
        .layer(COMMON_DEFAULTS.iter().copied())
        .layer(global.clone())
        .layer(pinned.clone())
        .resolve()
}

/// Resolve the configuration of one step instance
///
/// Layers, low to high: common defaults, type defaults, global variables,
/// the instance config file, then `pinned` run values. Fails if a key the
/// step type requires is absent or empty afterwards.
pub fn resolve(
    global: &ConfigMap,
    instance: &StepInstance,
    instance_config: Option<&ConfigMap>,
    pinned: &ConfigMap,
) -> Result<ResolvedConfig, ConfigError> {
    let mut layers = ConfigLayers::new()
        .layer(COMMON_DEFAULTS.iter().copied())
        .layer(instance.step_type.defaults())
        .layer(global.clone());
    if let Some(config) = instance_config {
        layers = layers.layer(config.clone());
    }
    let resolved = layers.layer(pinned.clone()).resolve()?;

    for key in instance.step_type.required_keys() {
        if resolved.get(key).map_or(true, |v| v.trim().is_empty()) {
            return Err(ConfigError::MissingRequiredKey {
                step: instance.id.clone(),
                key: key.to_string(),
            });
        }
    }

    Ok(resolved)
}
