//! `deployctl run` — execute one rollout to a terminal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use deploy_core::{DeploymentSpec, RolloutRecord, RolloutState};
use deploy_health::{CancelSignal, HttpProber, ProbeStatus, cancel_pair};
use deploy_rollout::memory::{MemoryApplier, MemoryBuilder, MemoryQuality, ScriptedProber};
use deploy_rollout::{Collaborators, RolloutController};
use deploy_state::StateStore;

use super::{Loaded, Overrides, load};
use crate::shell::{ShellApplier, ShellBuilder, ShellQuality};
use crate::sinks::{ProgressSink, StoreSink};

/// Records kept per environment.
pub const HISTORY_LIMIT: usize = 50;

pub struct RunOptions<'a> {
    pub config: &'a Path,
    pub overrides: &'a Overrides,
    pub state_dir: &'a Path,
    pub dry_run: bool,
    pub format: &'a str,
}

pub fn open_store(state_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("cannot create state directory {}", state_dir.display()))?;
    let path: PathBuf = state_dir.join("state.redb");
    StateStore::open(&path).with_context(|| format!("cannot open {}", path.display()))
}

/// Collaborators that shell out to the configured tools.
fn shell_collaborators(loaded: &Loaded) -> anyhow::Result<Collaborators> {
    let artifact = &loaded.config.artifact;
    let apply = loaded
        .config
        .apply
        .as_ref()
        .context("an [apply] section is required (or pass --dry-run)")?;

    let builder = ShellBuilder::new(
        &loaded.base_dir,
        artifact.build.clone(),
        artifact.publish.clone(),
    );
    let applier = ShellApplier::new(
        &loaded.base_dir,
        loaded.spec.name.clone(),
        apply.command.clone(),
        apply.ready.clone(),
    );
    let mut collaborators = Collaborators::new(
        Arc::new(builder),
        Arc::new(applier),
        Arc::new(HttpProber::new()),
    );
    if let Some(commands) = artifact.quality.clone().filter(|c| !c.is_empty()) {
        collaborators =
            collaborators.with_quality(Arc::new(ShellQuality::new(&loaded.base_dir, commands)));
    }
    Ok(collaborators)
}

/// Collaborators that never leave the process.
fn dry_run_collaborators(loaded: &Loaded) -> Collaborators {
    let mut collaborators = Collaborators::new(
        Arc::new(MemoryBuilder::new()),
        Arc::new(MemoryApplier::new()),
        Arc::new(ScriptedProber::always(ProbeStatus::Healthy)),
    );
    if loaded.config.artifact.quality.as_ref().is_some_and(|c| !c.is_empty()) {
        collaborators = collaborators.with_quality(Arc::new(MemoryQuality::passing()));
    }
    collaborators
}

/// Run `spec` against its environment's known-good set, persist the
/// outcome, and trim old history.
pub async fn execute(
    spec: &DeploymentSpec,
    collaborators: Collaborators,
    store: &StateStore,
    cancel: CancelSignal,
) -> anyhow::Result<RolloutRecord> {
    let environment = spec.target.environment.as_str();
    let known_good = store.get_known_good(environment)?;
    match &known_good {
        Some(set) => info!(environment, rollout = %set.rollout_id, "known-good set loaded"),
        None => info!(environment, "no known-good set; rollback unavailable"),
    }

    let collaborators = collaborators.with_sink(Arc::new(StoreSink::new(store.clone())));
    let record = RolloutController::new(collaborators)
        .run(spec.clone(), known_good, cancel)
        .await;

    let pruned = store.prune_rollouts(environment, HISTORY_LIMIT)?;
    if pruned > 0 {
        info!(environment, pruned, "old rollout records removed");
    }
    Ok(record)
}

/// Returns the process exit code for the rollout's terminal state.
pub async fn run(opts: RunOptions<'_>) -> anyhow::Result<i32> {
    let loaded = load(opts.config, opts.overrides)?;
    let (store, collaborators) = if opts.dry_run {
        info!("dry run: no commands are executed and nothing is persisted");
        (StateStore::open_in_memory()?, dry_run_collaborators(&loaded))
    } else {
        (open_store(opts.state_dir)?, shell_collaborators(&loaded)?)
    };
    let collaborators = if opts.format == "json" {
        collaborators
    } else {
        collaborators.with_sink(Arc::new(ProgressSink::new()))
    };

    let (handle, signal) = cancel_pair();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling rollout");
            handle.cancel();
        }
    });

    let record = execute(&loaded.spec, collaborators, &store, signal).await?;
    interrupt.abort();

    match opts.format {
        "json" => println!("{}", serde_json::to_string_pretty(&record)?),
        _ => {
            println!("{}", record.summary());
            if record.state == RolloutState::RollbackFailed {
                eprintln!(
                    "✗ {} matches neither the new nor the known-good version; manual intervention required",
                    record.environment()
                );
            }
        }
    }
    Ok(record.state.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::{ArtifactRef, CollaboratorError, StageKind};

    use crate::commands::fixtures::scaffold_into;

    fn loaded() -> (tempfile::TempDir, Loaded) {
        let dir = tempfile::tempdir().unwrap();
        let path = scaffold_into(dir.path());
        let mut loaded = load(&path, &Overrides::default()).unwrap();
        loaded.spec.policy.backoff_base = std::time::Duration::from_millis(1);
        loaded.spec.policy.backoff_cap = std::time::Duration::from_millis(1);
        (dir, loaded)
    }

    #[tokio::test]
    async fn dry_run_succeeds_and_records_known_good() {
        let (_dir, loaded) = loaded();
        let store = StateStore::open_in_memory().unwrap();

        let record = execute(
            &loaded.spec,
            dry_run_collaborators(&loaded),
            &store,
            CancelSignal::never(),
        )
        .await
        .unwrap();

        assert_eq!(record.state, RolloutState::Succeeded);
        assert_eq!(record.state.exit_code(), 0);
        let good = store.get_known_good("staging").unwrap().unwrap();
        assert_eq!(good.rollout_id, record.id);
        assert_eq!(store.list_rollouts("staging").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_rollout_rolls_back_to_the_first() {
        let (_dir, loaded) = loaded();
        let store = StateStore::open_in_memory().unwrap();
        let builder = Arc::new(MemoryBuilder::with_tag("v1"));
        let applier = Arc::new(MemoryApplier::new());
        let collaborators = Collaborators::new(
            builder,
            applier.clone(),
            Arc::new(ScriptedProber::always(ProbeStatus::Healthy)),
        );

        let first = execute(&loaded.spec, collaborators, &store, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(first.state, RolloutState::Succeeded);

        applier.fail_on("workload", CollaboratorError::permanent("bad image"));
        let collaborators = Collaborators::new(
            Arc::new(MemoryBuilder::with_tag("v2")),
            applier.clone(),
            Arc::new(ScriptedProber::always(ProbeStatus::Healthy)),
        );
        let second = execute(&loaded.spec, collaborators, &store, CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(second.state, RolloutState::RolledBack);
        assert_eq!(second.state.exit_code(), 2);
        assert!(second.stages_of(&StageKind::Rollback).next().is_some());
        assert_eq!(
            applier.live_artifact("config"),
            Some(ArtifactRef("registry.local/chatbot:v1".to_string()))
        );
        // The failed rollout is stored but does not replace known-good.
        assert_eq!(
            store.get_known_good("staging").unwrap().unwrap().rollout_id,
            first.id
        );
        assert_eq!(store.list_rollouts("staging").unwrap().len(), 2);
    }

    #[test]
    fn real_run_requires_apply_section() {
        let (_dir, mut loaded) = loaded();
        loaded.config.apply = None;
        let err = shell_collaborators(&loaded).err().unwrap();
        assert!(err.to_string().contains("[apply]"));
    }
}
