use std::path::Path;

use deploy_core::{StageKind, format_duration};
use deploy_rollout::planned_stages;

use super::{Overrides, load};

/// Check deploy.toml and print the resource apply order.
pub fn validate(path: &Path, overrides: &Overrides) -> anyhow::Result<()> {
    let loaded = load(path, overrides)?;
    let order = loaded.spec.validate()?;

    println!("✓ {} is valid", path.display());
    println!(
        "  deployment {} → {} (namespace {})",
        loaded.spec.name, loaded.spec.target.environment, loaded.spec.target.namespace
    );
    for (i, resource) in order.iter().enumerate() {
        let deps = if resource.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                " (after {})",
                resource.depends_on.iter().cloned().collect::<Vec<_>>().join(", ")
            )
        };
        println!("  {}. {}{deps}", i + 1, resource.name);
    }
    Ok(())
}

/// Print the stages a rollout would run.
pub fn plan(path: &Path, overrides: &Overrides, format: &str) -> anyhow::Result<()> {
    let loaded = load(path, overrides)?;
    let stages = planned_stages(&loaded.spec)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&stages)?);
        }
        _ => {
            println!("{}", format_plan(&loaded.spec, &stages));
        }
    }
    Ok(())
}

fn format_plan(spec: &deploy_core::DeploymentSpec, stages: &[StageKind]) -> String {
    let policy = &spec.policy;
    let mut out = format!(
        "Rollout plan for {} → {}\n",
        spec.name, spec.target.environment
    );
    for (i, stage) in stages.iter().enumerate() {
        out.push_str(&format!("  {:>2}. {stage}\n", i + 1));
    }
    out.push_str(&format!(
        "Policy: stage timeout {}, {} retries (backoff {}..{}), rollback {}, quality gate {}\n",
        format_duration(policy.stage_timeout),
        policy.max_retries,
        format_duration(policy.backoff_base),
        format_duration(policy.backoff_cap),
        if policy.rollback_enabled { "on" } else { "off" },
        if policy.strict_quality_gate { "strict" } else { "advisory" },
    ));
    out.push_str(&format!(
        "Health: {} every {} for up to {}",
        spec.health.endpoint,
        format_duration(spec.health.poll_interval),
        format_duration(spec.health.deadline),
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::fixtures::scaffold_into;

    #[test]
    fn plan_lists_stages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = scaffold_into(dir.path());
        let loaded = load(&path, &Overrides::default()).unwrap();
        let stages = planned_stages(&loaded.spec).unwrap();

        let text = format_plan(&loaded.spec, &stages);

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1].trim(), "1. quality-gate");
        assert_eq!(lines[2].trim(), "2. build");
        assert_eq!(lines[4].trim(), "4. apply(namespace)");
        assert!(text.contains("wait-ready(workload)"), "{text}");
        assert!(text.contains("rollback on"));
        assert!(text.ends_with("for up to 2m"), "{text}");
    }

    #[test]
    fn validate_accepts_scaffold() {
        let dir = tempfile::tempdir().unwrap();
        let path = scaffold_into(dir.path());
        validate(&path, &Overrides::default()).unwrap();
    }
}
