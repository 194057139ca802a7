//! Prepare phase - datapool scaffolding and raw data staging
//!
//! Runs before any step, whether or not tokenize steps are enabled, and is
//! safe to repeat: directories are only created when missing and staged files
//! are skipped when an identical copy is already in place.

pub mod clone;
pub mod copy;
pub mod layout;

pub use copy::{CopyMode, MergeStats};
pub use layout::DatapoolLayout;

use crate::core::{
    config::ConfigMap,
    context::RunContext,
    error::PrepareError,
    pipeline::Pipeline,
    resolver::{resolve_global, ConfigLayers, ResolvedConfig},
    step::{DataCategory, StepInstance},
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Options of the prepare phase
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareOptions {
    pub mode: CopyMode,
}

/// What happened to one tokenize instance's raw data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RawDataStatus {
    /// Source merged into the raw area
    Merged(MergeStats),
    /// An earlier instance of the same category already merged this source
    AlreadyMerged,
    /// The instance declares no raw data source
    NoSource,
    Failed { error: String },
}

/// Raw data staging of one `(category, occurrence)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDataGroup {
    pub category: DataCategory,
    pub occurrence_index: usize,
    pub step_id: String,
    pub enabled: bool,
    pub source: Option<PathBuf>,
    pub destination: PathBuf,
    pub outcome: RawDataStatus,
}

/// Base model staging outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseModelReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Files copied; zero when the model was already present
    pub files: usize,
    pub already_present: bool,
}

/// Summary of the prepare phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareReport {
    pub datapool_root: PathBuf,
    pub dry_run: bool,
    /// Directories created, or that would be in dry-run mode
    pub created_dirs: Vec<PathBuf>,
    pub raw_data: Vec<RawDataGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_model: Option<BaseModelReport>,
    pub warnings: Vec<String>,
}

/// Staging configuration of an instance: no required-key checks, since a
/// disabled instance is scanned too
fn staging_config(
    pipeline: &Pipeline,
    instance: &StepInstance,
    pinned: &ConfigMap,
) -> Result<ResolvedConfig, PrepareError> {
    let mut layers = ConfigLayers::new().layer(pipeline.variables.clone());
    if let Some(config) = pipeline.load_instance_config(instance)? {
        layers = layers.layer(config);
    }
    Ok(layers.layer(pinned.clone()).resolve()?)
}

fn non_empty<'a>(config: &'a ResolvedConfig, key: &str) -> Option<&'a str> {
    config.get(key).filter(|v| !v.trim().is_empty())
}

/// Run the prepare phase for a validated pipeline
pub fn prepare(pipeline: &Pipeline, ctx: &RunContext, options: &PrepareOptions) -> Result<PrepareReport, PrepareError> {
    let layout = DatapoolLayout::new(&ctx.datapool_root);
    let pinned = ctx.pinned_variables();
    let mut failures = Vec::new();

    let mut report = PrepareReport {
        datapool_root: ctx.datapool_root.clone(),
        dry_run: ctx.dry_run,
        ..Default::default()
    };

    report.created_dirs = if ctx.dry_run {
        layout.missing_directories()
    } else {
        layout.ensure()?
    };
    for dir in &report.created_dirs {
        info!("{} {}", if ctx.dry_run { "[dry-run] would create" } else { "Created" }, dir.display());
    }

    let mut merged_sources = HashSet::new();
    for instance in &pipeline.steps {
        let Some(category) = instance.step_type.category() else {
            continue;
        };
        let config = staging_config(pipeline, instance, &pinned)?;
        let group = stage_raw_data(instance, category, &config, ctx, &layout, options, &mut merged_sources);

        match &group.outcome {
            RawDataStatus::Failed { error } => {
                failures.push(format!("{} ({} #{}): {}", instance.id, category, instance.occurrence_index, error));
            }
            RawDataStatus::Merged(stats) => {
                for clash in &stats.clashes {
                    report.warnings.push(format!("{}: kept existing {}", instance.id, clash.display()));
                }
            }
            RawDataStatus::AlreadyMerged | RawDataStatus::NoSource => {}
        }
        report.raw_data.push(group);
    }

    let global = resolve_global(&pipeline.variables, &pinned)?;
    match stage_base_model(&global, ctx, &layout, options) {
        Ok(base_model) => report.base_model = base_model,
        Err(error) => failures.push(format!("base model: {}", error)),
    }

    if !failures.is_empty() {
        for failure in &failures {
            warn!("Prepare failure: {}", failure);
        }
        return Err(PrepareError::Failed { failures });
    }

    Ok(report)
}

fn stage_raw_data(
    instance: &StepInstance,
    category: DataCategory,
    config: &ResolvedConfig,
    ctx: &RunContext,
    layout: &DatapoolLayout,
    options: &PrepareOptions,
    merged_sources: &mut HashSet<(DataCategory, PathBuf)>,
) -> RawDataGroup {
    let destination = layout.raw_dir(category);
    let source = non_empty(config, "RAW_COPY_SRC")
        .or_else(|| non_empty(config, category.raw_copy_key()))
        .map(|s| ctx.resolve_path(s));

    let outcome = match &source {
        None => RawDataStatus::NoSource,
        Some(src) if !merged_sources.insert((category, src.clone())) => RawDataStatus::AlreadyMerged,
        Some(src) => match copy::merge_jsonl(src, &destination, options.mode, ctx.dry_run) {
            Ok(stats) => {
                info!(
                    "{}: {} staged, {} already present from {}",
                    instance.id,
                    stats.copied,
                    stats.skipped,
                    src.display()
                );
                RawDataStatus::Merged(stats)
            }
            Err(e) => RawDataStatus::Failed { error: e.to_string() },
        },
    };

    RawDataGroup {
        category,
        occurrence_index: instance.occurrence_index,
        step_id: instance.id.clone(),
        enabled: instance.enabled,
        source,
        destination,
        outcome,
    }
}

fn stage_base_model(
    global: &ResolvedConfig,
    ctx: &RunContext,
    layout: &DatapoolLayout,
    options: &PrepareOptions,
) -> Result<Option<BaseModelReport>, std::io::Error> {
    let Some(source) = non_empty(global, "BASE_MODEL_SRC").map(|s| ctx.resolve_path(s)) else {
        return Ok(None);
    };
    let name = non_empty(global, "BASE_MODEL_NAME").unwrap_or("base_model");
    let destination = layout.base_model_dir(name);

    if destination.exists() {
        info!("Base model already present at {}", destination.display());
        return Ok(Some(BaseModelReport {
            source,
            destination,
            files: 0,
            already_present: true,
        }));
    }
    if !source.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("BASE_MODEL_SRC {} does not exist", source.display()),
        ));
    }

    let files = copy::copy_tree(&source, &destination, options.mode, ctx.dry_run)?;
    info!("Base model: {} files from {} to {}", files, source.display(), destination.display());

    Ok(Some(BaseModelReport {
        source,
        destination,
        files,
        already_present: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn context(root: &Path, dry_run: bool) -> RunContext {
        RunContext {
            root_dir: root.to_path_buf(),
            config_dir: root.join("configs"),
            datapool_root: root.join("pool"),
            run_id: "r1".to_string(),
            work_dir: root.join(".llmrunner"),
            run_dir: root.join(".llmrunner/runs/r1"),
            log_dir: root.join(".llmrunner/runs/r1/logs"),
            dry_run,
            allow_external_paths: false,
        }
    }

    fn pipeline(yaml: &str, root: &Path) -> Pipeline {
        PipelineConfig::from_yaml(yaml)
            .unwrap()
            .to_pipeline(root.join("configs"))
            .unwrap()
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_prepare_stages_disabled_tokenize_steps() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("raw/cpt/a.jsonl"), "{\"text\":\"a\"}\n");

        let p = pipeline(
            r#"
variables:
  CPT_RAW_COPY_SRC: raw/cpt
steps:
  - id: tokenize_cpt_0
    type: tokenize_cpt
    enabled: false
  - train_cpt
"#,
            temp.path(),
        );
        let ctx = context(temp.path(), false);

        let report = prepare(&p, &ctx, &PrepareOptions::default()).unwrap();
        assert_eq!(report.raw_data.len(), 1);
        assert!(!report.raw_data[0].enabled);
        assert!(temp.path().join("pool/data/raw/cpt/a.jsonl").is_file());
        assert!(temp.path().join("pool/model/hf").is_dir());

        // Second run changes nothing
        let again = prepare(&p, &ctx, &PrepareOptions::default()).unwrap();
        assert!(again.created_dirs.is_empty());
        match &again.raw_data[0].outcome {
            RawDataStatus::Merged(stats) => {
                assert_eq!(stats.copied, 0);
                assert_eq!(stats.skipped, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_same_source_merged_once() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("raw/a.jsonl"), "x\n");

        let p = pipeline(
            "variables:\n  RAW_COPY_SRC: raw\nsteps:\n  - tokenize_sft\n  - tokenize_sft\n",
            temp.path(),
        );
        let report = prepare(&p, &context(temp.path(), false), &PrepareOptions::default()).unwrap();
        assert!(matches!(report.raw_data[0].outcome, RawDataStatus::Merged(_)));
        assert_eq!(report.raw_data[1].outcome, RawDataStatus::AlreadyMerged);
        assert_eq!(report.raw_data[1].occurrence_index, 1);
    }

    #[test]
    fn test_missing_source_fails_but_other_categories_proceed() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("raw/sft/b.jsonl"), "y\n");

        let p = pipeline(
            r#"
variables:
  CPT_RAW_COPY_SRC: raw/missing
  SFT_RAW_COPY_SRC: raw/sft
steps: [tokenize_cpt, tokenize_sft]
"#,
            temp.path(),
        );
        let err = prepare(&p, &context(temp.path(), false), &PrepareOptions::default()).unwrap_err();
        match err {
            PrepareError::Failed { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("tokenize_cpt_0"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(temp.path().join("pool/data/raw/sft/b.jsonl").is_file());
    }

    #[test]
    fn test_base_model_copied_once() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("models/qwen/config.json"), "{}");

        let p = pipeline(
            "variables:\n  BASE_MODEL_SRC: models/qwen\n  BASE_MODEL_NAME: qwen\nsteps: []\n",
            temp.path(),
        );
        let ctx = context(temp.path(), false);

        let first = prepare(&p, &ctx, &PrepareOptions::default()).unwrap();
        let base = first.base_model.unwrap();
        assert_eq!(base.files, 1);
        assert!(temp.path().join("pool/model/base/qwen/config.json").is_file());

        let second = prepare(&p, &ctx, &PrepareOptions::default()).unwrap();
        assert!(second.base_model.unwrap().already_present);
    }

    #[test]
    fn test_missing_base_model_is_failure() {
        let temp = TempDir::new().unwrap();
        let p = pipeline("variables:\n  BASE_MODEL_SRC: /nonexistent/model\nsteps: []\n", temp.path());
        assert!(matches!(
            prepare(&p, &context(temp.path(), false), &PrepareOptions::default()),
            Err(PrepareError::Failed { .. })
        ));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("raw/a.jsonl"), "x\n");
        write(&temp.path().join("models/m/w.bin"), "w");

        let p = pipeline(
            "variables:\n  CPT_RAW_COPY_SRC: raw\n  BASE_MODEL_SRC: models/m\nsteps: [tokenize_cpt]\n",
            temp.path(),
        );
        let report = prepare(&p, &context(temp.path(), true), &PrepareOptions::default()).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.created_dirs.len(), DatapoolLayout::new("/x").directories().len());
        assert_eq!(report.base_model.unwrap().files, 1);
        assert!(!temp.path().join("pool").exists());
    }
}
