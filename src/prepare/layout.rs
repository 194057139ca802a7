use crate::core::error::PrepareError;
use crate::core::step::DataCategory;
use std::path::{Path, PathBuf};

/// Data stages kept per category under `data/`
pub const DATA_STAGES: [&str; 3] = ["raw", "processed", "tokenized"];

/// Subdirectories of `model/`
pub const MODEL_DIRS: [&str; 4] = ["base", "cpt_checkpoints", "sft_checkpoints", "hf"];

/// Directory layout of an experiment datapool.
///
/// `data/{raw,processed,tokenized}/{cpt,sft}`, `model/{base,cpt_checkpoints,sft_checkpoints,hf}`
/// and `reports/`. Step scripts rely on these paths.
#[derive(Debug, Clone)]
pub struct DatapoolLayout {
    root: PathBuf,
}

impl DatapoolLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn data_dir(&self, stage: &str, category: DataCategory) -> PathBuf {
        self.root.join("data").join(stage).join(category.as_str())
    }

    #[must_use]
    pub fn raw_dir(&self, category: DataCategory) -> PathBuf {
        self.data_dir("raw", category)
    }

    #[must_use]
    pub fn model_dir(&self, name: &str) -> PathBuf {
        self.root.join("model").join(name)
    }

    #[must_use]
    pub fn base_model_dir(&self, model_name: &str) -> PathBuf {
        self.model_dir("base").join(model_name)
    }

    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Top-level subtrees copied when an experiment is cloned
    #[must_use]
    pub fn subtrees(&self) -> [PathBuf; 3] {
        [self.root.join("data"), self.root.join("model"), self.reports_dir()]
    }

    /// Every directory of the layout
    #[must_use]
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        for category in [DataCategory::Cpt, DataCategory::Sft] {
            dirs.extend(self.category_directories(category));
        }
        dirs.extend(MODEL_DIRS.iter().map(|name| self.model_dir(name)));
        dirs.push(self.reports_dir());
        dirs
    }

    /// The raw, processed and tokenized directories of one category
    #[must_use]
    pub fn category_directories(&self, category: DataCategory) -> Vec<PathBuf> {
        DATA_STAGES
            .iter()
            .map(|stage| self.data_dir(stage, category))
            .collect()
    }

    /// Layout directories that do not exist yet
    #[must_use]
    pub fn missing_directories(&self) -> Vec<PathBuf> {
        self.directories().into_iter().filter(|d| !d.is_dir()).collect()
    }

    /// Create missing layout directories, returning the ones created
    pub fn ensure(&self) -> Result<Vec<PathBuf>, PrepareError> {
        let missing = self.missing_directories();
        for dir in &missing {
            std::fs::create_dir_all(dir).map_err(|source| PrepareError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(missing)
    }
}
