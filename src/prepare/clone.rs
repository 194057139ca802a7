//! Experiment cloning
//!
//! Experiments live in two trees: `configs/experiments/<name>` for the pipeline
//! and step configs, and `datapool/experiments/<name>` for data, models and
//! reports. Cloning copies the config tree, points it at the new datapool and
//! scaffolds that datapool, optionally seeding it with the source's contents.

use crate::core::error::{FailureCategory, PrepareError};
use crate::prepare::copy::{copy_tree, CopyMode};
use crate::prepare::layout::DatapoolLayout;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum CloneError {
    #[error("invalid experiment name '{0}'")]
    InvalidName(String),

    #[error("experiment config not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("experiment config already exists: {}", .0.display())]
    TargetExists(PathBuf),

    #[error(transparent)]
    Prepare(#[from] PrepareError),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CloneError {
    pub fn category(&self) -> FailureCategory {
        match self {
            CloneError::InvalidName(_) | CloneError::SourceMissing(_) | CloneError::TargetExists(_) => {
                FailureCategory::Configuration
            }
            CloneError::Prepare(_) | CloneError::Io { .. } => FailureCategory::Prepare,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    /// Also copy `data/`, `model/` and `reports/` of the source datapool
    pub copy_datapool: bool,
    pub mode: CopyMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloneReport {
    pub config_dir: PathBuf,
    pub datapool_root: PathBuf,
    /// Config files whose datapool references were rewritten
    pub rewritten: Vec<PathBuf>,
    pub created_dirs: Vec<PathBuf>,
    /// Datapool subtrees copied from the source
    pub copied: Vec<PathBuf>,
    /// Datapool subtrees left alone because the target already had them
    pub skipped: Vec<PathBuf>,
}

pub fn experiment_config_dir(root: &Path, name: &str) -> PathBuf {
    root.join("configs").join("experiments").join(name)
}

pub fn experiment_datapool(root: &Path, name: &str) -> PathBuf {
    root.join("datapool").join("experiments").join(name)
}

fn check_name(name: &str) -> Result<(), CloneError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CloneError::InvalidName(name.to_string()))
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CloneError + '_ {
    move |source| CloneError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Point `experiments/<source>` references at `experiments/<target>`
pub fn rewrite_references(text: &str, source: &str, target: &str) -> String {
    let pattern = format!(r#"experiments/{}(?P<end>[/"'\s]|$)"#, regex::escape(source));
    match Regex::new(&pattern) {
        Ok(re) => re
            .replace_all(text, format!("experiments/{}${{end}}", target).as_str())
            .into_owned(),
        Err(_) => text.to_string(),
    }
}

/// Clone experiment `source` to `target` under `root`
pub fn clone_experiment(
    root: &Path,
    source: &str,
    target: &str,
    options: &CloneOptions,
) -> Result<CloneReport, CloneError> {
    check_name(source)?;
    check_name(target)?;

    let source_config = experiment_config_dir(root, source);
    let target_config = experiment_config_dir(root, target);
    if !source_config.is_dir() {
        return Err(CloneError::SourceMissing(source_config));
    }
    if target_config.exists() {
        return Err(CloneError::TargetExists(target_config));
    }

    copy_tree(&source_config, &target_config, CopyMode::Copy, false).map_err(io_error(&target_config))?;
    info!("Copied {} -> {}", source_config.display(), target_config.display());

    let mut rewritten = Vec::new();
    for entry in WalkDir::new(&target_config).sort_by_file_name() {
        let entry = entry.map_err(|e| CloneError::Io {
            path: target_config.clone(),
            source: e.into(),
        })?;
        let is_yaml = matches!(
            entry.path().extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !entry.file_type().is_file() || !is_yaml {
            continue;
        }

        let path = entry.path();
        let text = fs::read_to_string(path).map_err(io_error(path))?;
        let updated = rewrite_references(&text, source, target);
        if updated != text {
            fs::write(path, updated).map_err(io_error(path))?;
            rewritten.push(path.to_path_buf());
        }
    }

    let source_pool = DatapoolLayout::new(experiment_datapool(root, source));
    let target_pool = DatapoolLayout::new(experiment_datapool(root, target));

    let mut copied = Vec::new();
    let mut skipped = Vec::new();
    if options.copy_datapool {
        for (from, to) in source_pool.subtrees().into_iter().zip(target_pool.subtrees()) {
            if !from.is_dir() {
                continue;
            }
            if to.exists() {
                skipped.push(to);
                continue;
            }
            let files = copy_tree(&from, &to, options.mode, false).map_err(io_error(&to))?;
            info!("Copied {} files into {}", files, to.display());
            copied.push(to);
        }
    }

    let created_dirs = target_pool.ensure()?;

    Ok(CloneReport {
        config_dir: target_config,
        datapool_root: target_pool.root().to_path_buf(),
        rewritten,
        created_dirs,
        copied,
        skipped,
    })
}
