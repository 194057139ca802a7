//! Step types, step instances and the step list validator
//!
//! A pipeline declares its steps either as bare step type names (the legacy
//! shorthand) or as instance descriptors. [`validate_steps`] normalizes both
//! forms into [`StepInstance`]s and enforces the identity rules, so nothing
//! downstream ever sees the raw declaration.

use crate::core::config::parse_flag;
use crate::core::error::ConfigError;
use crate::core::resolver::ResolvedConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Category of pipeline stage
///
/// Variant order is the canonical registry order, used by the legacy
/// `STEP_<TYPE>_ENABLED` declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Udatasets,
    TokenizeCpt,
    TokenizeSft,
    TrainCpt,
    Mg2hf,
    Hf2mg,
    TrainSft,
    Eval,
}

/// Data category staged by the tokenize steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    Cpt,
    Sft,
}

impl DataCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DataCategory::Cpt => "cpt",
            DataCategory::Sft => "sft",
        }
    }

    /// Category-specific variable naming the raw data source
    pub fn raw_copy_key(self) -> &'static str {
        match self {
            DataCategory::Cpt => "CPT_RAW_COPY_SRC",
            DataCategory::Sft => "SFT_RAW_COPY_SRC",
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TOKENIZE_CPT_DEFAULTS: &[(&str, &str)] = &[
    ("INPUT_DATA_PATH", "${DATAPOOL_ROOT}/data/raw/cpt"),
    ("OUTPUT_PREFIX", "${DATAPOOL_ROOT}/data/tokenized/cpt/${MODEL_PREFIX}"),
    ("TOKENIZER_TYPE", "HuggingFaceTokenizer"),
    ("JSON_KEYS", "text"),
    ("WORKERS", "16"),
    ("PARTITIONS", "16"),
    ("LOG_INTERVAL", "100000"),
];

const TOKENIZE_SFT_DEFAULTS: &[(&str, &str)] = &[
    ("INPUT_DATA_PATH", "${DATAPOOL_ROOT}/data/raw/sft"),
    ("OUTPUT_PREFIX", "${DATAPOOL_ROOT}/data/tokenized/sft/${MODEL_PREFIX}"),
    ("TOKENIZER_TYPE", "HuggingFaceTokenizer"),
    ("JSON_KEYS", "instruction input output"),
    ("WORKERS", "16"),
    ("PARTITIONS", "16"),
    ("LOG_INTERVAL", "100000"),
];

impl StepType {
    /// All step types in registry order
    pub const ALL: [StepType; 8] = [
        StepType::Udatasets,
        StepType::TokenizeCpt,
        StepType::TokenizeSft,
        StepType::TrainCpt,
        StepType::Mg2hf,
        StepType::Hf2mg,
        StepType::TrainSft,
        StepType::Eval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Udatasets => "udatasets",
            StepType::TokenizeCpt => "tokenize_cpt",
            StepType::TokenizeSft => "tokenize_sft",
            StepType::TrainCpt => "train_cpt",
            StepType::Mg2hf => "mg2hf",
            StepType::Hf2mg => "hf2mg",
            StepType::TrainSft => "train_sft",
            StepType::Eval => "eval",
        }
    }

    /// Data category for tokenize steps, `None` for everything else
    pub fn category(self) -> Option<DataCategory> {
        match self {
            StepType::TokenizeCpt => Some(DataCategory::Cpt),
            StepType::TokenizeSft => Some(DataCategory::Sft),
            _ => None,
        }
    }

    /// Keys that must be present and non-empty after resolution
    pub fn required_keys(self) -> &'static [&'static str] {
        match self {
            StepType::Udatasets => &["SCRIPT", "DATAPOOL_ROOT", "OUTPUT_DIR"],
            StepType::TokenizeCpt | StepType::TokenizeSft => &[
                "SCRIPT",
                "DATAPOOL_ROOT",
                "INPUT_DATA_PATH",
                "OUTPUT_PREFIX",
                "TOKENIZER_PATH",
            ],
            StepType::TrainCpt | StepType::TrainSft => &[
                "SCRIPT",
                "DATAPOOL_ROOT",
                "INPUT_DATA_PATH",
                "OUTPUT_MODEL_PATH",
            ],
            StepType::Mg2hf => &["SCRIPT", "DATAPOOL_ROOT", "IN_CKPT_DIR", "OUT_HF_DIR"],
            StepType::Hf2mg => &["SCRIPT", "DATAPOOL_ROOT", "IN_HF_DIR", "OUT_CKPT_DIR"],
            StepType::Eval => &["SCRIPT", "DATAPOOL_ROOT", "OUTPUT_DIR"],
        }
    }

    /// Built-in defaults, the lowest-precedence configuration layer
    pub fn defaults(self) -> Vec<(String, String)> {
        let specific: &[(&str, &str)] = match self {
            StepType::Udatasets => &[("OUTPUT_DIR", "${DATAPOOL_ROOT}/data/processed")],
            StepType::TokenizeCpt => TOKENIZE_CPT_DEFAULTS,
            StepType::TokenizeSft => TOKENIZE_SFT_DEFAULTS,
            StepType::TrainCpt => &[
                ("INPUT_DATA_PATH", "${DATAPOOL_ROOT}/data/tokenized/cpt"),
                ("OUTPUT_MODEL_PATH", "${DATAPOOL_ROOT}/model/cpt_checkpoints"),
            ],
            StepType::TrainSft => &[
                ("INPUT_DATA_PATH", "${DATAPOOL_ROOT}/data/tokenized/sft"),
                ("OUTPUT_MODEL_PATH", "${DATAPOOL_ROOT}/model/sft_checkpoints"),
            ],
            StepType::Mg2hf => &[
                ("IN_CKPT_DIR", "${DATAPOOL_ROOT}/model/cpt_checkpoints"),
                ("OUT_HF_DIR", "${DATAPOOL_ROOT}/model/hf"),
            ],
            StepType::Hf2mg => &[
                ("IN_HF_DIR", "${DATAPOOL_ROOT}/model/hf"),
                ("OUT_CKPT_DIR", "${DATAPOOL_ROOT}/model/cpt_checkpoints"),
            ],
            StepType::Eval => &[("OUTPUT_DIR", "${DATAPOOL_ROOT}/reports")],
        };

        let mut defaults = vec![("SCRIPT".to_string(), self.default_script())];
        defaults.extend(
            specific
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string())),
        );
        defaults
    }

    /// Command template run when a step config does not set `SCRIPT`
    pub fn default_script(self) -> String {
        format!("python3 ${{ROOT_DIR}}/scripts/steps/{}.py", self.as_str())
    }

    /// Directory a step writes its results into, when the type has one
    pub fn output_dir(self, config: &ResolvedConfig) -> Option<PathBuf> {
        let non_empty = |key: &str| config.get(key).filter(|v| !v.is_empty());
        let dir = match self {
            StepType::Udatasets | StepType::Eval => non_empty("OUTPUT_DIR").map(PathBuf::from),
            StepType::TokenizeCpt | StepType::TokenizeSft => non_empty("OUTPUT_PREFIX")
                .and_then(|prefix| Path::new(prefix).parent().map(Path::to_path_buf)),
            StepType::Mg2hf => non_empty("OUT_HF_DIR").map(PathBuf::from),
            StepType::TrainCpt | StepType::TrainSft | StepType::Hf2mg => None,
        };
        dir.filter(|d| !d.as_os_str().is_empty())
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownStepType(s.to_string()))
    }
}

/// Policy for the numeric suffix of explicit step ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdPolicy {
    /// The suffix is a free distinguishing tag
    #[default]
    Tag,
    /// The suffix must equal the occurrence index of the instance
    Canonical,
}

/// A step entry as written in the pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStep {
    /// Legacy shorthand: a bare step type name
    Name(String),
    /// Explicit instance descriptor
    Descriptor(StepDescriptor),
}

/// Explicit step instance descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Instance id, `<type>_<index>`; derived from the occurrence when omitted
    #[serde(default)]
    pub id: Option<String>,

    /// Step type name
    #[serde(default, rename = "type", alias = "step")]
    pub step_type: Option<String>,

    /// Step config file, relative to the config directory
    #[serde(default)]
    pub config: Option<String>,

    #[serde(default = "default_enabled", deserialize_with = "deserialize_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn deserialize_enabled<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = serde_yaml::Value::deserialize(deserializer)?;
    match &value {
        serde_yaml::Value::Bool(b) => Ok(*b),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(i != 0),
            None => Err(D::Error::custom(format!("invalid 'enabled' value: {}", n))),
        },
        serde_yaml::Value::String(s) => {
            parse_flag(s).ok_or_else(|| D::Error::custom(format!("invalid 'enabled' value: {:?}", s)))
        }
        other => Err(D::Error::custom(format!("invalid 'enabled' value: {:?}", other))),
    }
}

/// A validated, uniquely identified step of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInstance {
    /// Unique id, `<type>_<index>`
    pub id: String,

    pub step_type: StepType,

    /// Numeric suffix of `id`
    pub index: u64,

    /// Step config file, relative to the config directory
    pub config_path: Option<PathBuf>,

    pub enabled: bool,

    /// Rank among instances of the same type, in declaration order
    pub occurrence_index: usize,

    /// Position in the step list
    pub position: usize,
}

/// Split a step id into its type and numeric suffix
pub fn parse_step_id(id: &str) -> Result<(StepType, u64), ConfigError> {
    let invalid = || ConfigError::InvalidIdFormat { id: id.to_string() };

    let (prefix, suffix) = id.rsplit_once('_').ok_or_else(invalid)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let index = suffix.parse::<u64>().map_err(|_| invalid())?;
    let step_type = prefix.parse::<StepType>().map_err(|_| invalid())?;

    Ok((step_type, index))
}

/// Validate a declared step list into ordered step instances
///
/// Checks per entry, in order: id format, type agreement, id uniqueness,
/// config file stem, then the id policy. Output order is input order.
pub fn validate_steps(raw: &[RawStep], policy: IdPolicy) -> Result<Vec<StepInstance>, ConfigError> {
    let mut seen_ids = HashSet::new();
    let mut occurrences: HashMap<StepType, usize> = HashMap::new();
    let mut instances = Vec::with_capacity(raw.len());

    for (position, entry) in raw.iter().enumerate() {
        let (explicit_id, declared, config, enabled) = match entry {
            RawStep::Name(name) => (None, Some(name.as_str()), None, true),
            RawStep::Descriptor(d) => (
                d.id.as_deref(),
                d.step_type.as_deref(),
                d.config.as_deref(),
                d.enabled,
            ),
        };

        let parsed = explicit_id.map(parse_step_id).transpose()?;

        let step_type = match (declared, parsed) {
            (Some(name), Some((parsed_type, _))) => {
                let declared_type = name.parse::<StepType>()?;
                if declared_type != parsed_type {
                    return Err(ConfigError::TypeMismatch {
                        id: explicit_id.unwrap_or_default().to_string(),
                        declared: declared_type.to_string(),
                        parsed: parsed_type.to_string(),
                    });
                }
                declared_type
            }
            (Some(name), None) => name.parse::<StepType>()?,
            (None, Some((parsed_type, _))) => parsed_type,
            (None, None) => return Err(ConfigError::MissingStepType { position }),
        };

        let counter = occurrences.entry(step_type).or_insert(0);
        let occurrence_index = *counter;
        *counter += 1;

        let (id, index) = match (explicit_id, parsed) {
            (Some(id), Some((_, index))) => (id.to_string(), index),
            _ => (format!("{}_{}", step_type, occurrence_index), occurrence_index as u64),
        };

        if !seen_ids.insert(id.clone()) {
            return Err(ConfigError::DuplicateId(id));
        }

        if let Some(config) = config {
            let stem = Path::new(config).file_stem().and_then(|s| s.to_str());
            if stem != Some(id.as_str()) {
                return Err(ConfigError::ConfigStemMismatch {
                    id,
                    config: config.to_string(),
                });
            }
        }

        if policy == IdPolicy::Canonical && index != occurrence_index as u64 {
            return Err(ConfigError::IdOccurrenceMismatch {
                id,
                expected: occurrence_index,
            });
        }

        instances.push(StepInstance {
            id,
            step_type,
            index,
            config_path: config.map(PathBuf::from),
            enabled,
            occurrence_index,
            position,
        });
    }

    Ok(instances)
}
