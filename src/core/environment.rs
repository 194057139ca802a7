//! Environment projection for external step commands

use crate::core::context::RunContext;
use crate::core::resolver::ResolvedConfig;
use crate::core::step::StepInstance;
use std::collections::BTreeMap;

/// Exact set of variables an external step process observes
pub type EnvironmentMap = BTreeMap<String, String>;

fn flag(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

/// Project a resolved instance into its process environment
///
/// Resolved keys come first; identity and run-scoped variables are laid over
/// them so a config file can never spoof `STEP_ID` and friends.
pub fn project(instance: &StepInstance, resolved: &ResolvedConfig, ctx: &RunContext) -> EnvironmentMap {
    let mut env: EnvironmentMap = resolved
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let config_path = instance
        .config_path
        .as_ref()
        .map(|p| ctx.config_dir.join(p).display().to_string())
        .unwrap_or_default();

    let identity = [
        ("STEP_ID", instance.id.clone()),
        ("STEP_TYPE", instance.step_type.to_string()),
        ("STEP_INDEX", instance.index.to_string()),
        ("STEP_OCCURRENCE_INDEX", instance.occurrence_index.to_string()),
        ("STEP_POSITION", instance.position.to_string()),
        ("STEP_CONFIG_PATH", config_path),
        ("DRY_RUN", flag(ctx.dry_run)),
        ("ALLOW_EXTERNAL_PATHS", flag(ctx.allow_external_paths)),
    ];
    for (key, value) in identity {
        env.insert(key.to_string(), value);
    }
    env.extend(ctx.pinned_variables());

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::StepType;
    use std::path::PathBuf;

    fn context(dry_run: bool) -> RunContext {
        RunContext {
            root_dir: PathBuf::from("/repo"),
            config_dir: PathBuf::from("/repo/configs/exp"),
            datapool_root: PathBuf::from("/dp"),
            run_id: "r1".to_string(),
            work_dir: PathBuf::from("/repo/.llmrunner"),
            run_dir: PathBuf::from("/repo/.llmrunner/runs/r1"),
            log_dir: PathBuf::from("/repo/.llmrunner/runs/r1/logs"),
            dry_run,
            allow_external_paths: false,
        }
    }

    fn instance() -> StepInstance {
        StepInstance {
            id: "train_cpt_7".to_string(),
            step_type: StepType::TrainCpt,
            index: 7,
            config_path: Some(PathBuf::from("steps/train_cpt_7.yaml")),
            enabled: true,
            occurrence_index: 1,
            position: 3,
        }
    }

    #[test]
    fn test_identity_and_run_variables() {
        let resolved = ResolvedConfig::from_pairs([("LR", "1e-5"), ("DATAPOOL_ROOT", "/dp")]);
        let env = project(&instance(), &resolved, &context(true));

        assert_eq!(env["LR"], "1e-5");
        assert_eq!(env["STEP_ID"], "train_cpt_7");
        assert_eq!(env["STEP_TYPE"], "train_cpt");
        assert_eq!(env["STEP_INDEX"], "7");
        assert_eq!(env["STEP_OCCURRENCE_INDEX"], "1");
        assert_eq!(env["STEP_POSITION"], "3");
        assert_eq!(env["STEP_CONFIG_PATH"], "/repo/configs/exp/steps/train_cpt_7.yaml");
        assert_eq!(env["DATAPOOL_ROOT"], "/dp");
        assert_eq!(env["RUN_DIR"], "/repo/.llmrunner/runs/r1");
        assert_eq!(env["DRY_RUN"], "1");
        assert_eq!(env["ALLOW_EXTERNAL_PATHS"], "0");
    }

    #[test]
    fn test_identity_wins_over_config() {
        let resolved = ResolvedConfig::from_pairs([("STEP_ID", "spoofed"), ("RUN_ID", "other")]);
        let env = project(&instance(), &resolved, &context(false));
        assert_eq!(env["STEP_ID"], "train_cpt_7");
        assert_eq!(env["RUN_ID"], "r1");
        assert_eq!(env["DRY_RUN"], "0");
    }

    #[test]
    fn test_projection_is_pure() {
        let resolved = ResolvedConfig::from_pairs([("A", "1")]);
        let ctx = context(false);
        assert_eq!(project(&instance(), &resolved, &ctx), project(&instance(), &resolved, &ctx));
    }
}
