//! Rollout controller — drives the rollout state machine.
//!
//! A rollout moves `Pending → Building → Publishing → Applying →
//! AwaitingHealth → Succeeded`, advancing only when the current stage
//! succeeded. Failures before the first successful apply simply fail the
//! rollout; failures after it roll back to the known-good set when the
//! policy allows.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, info, warn};

use deploy_core::{
    ArtifactRef, DeploymentSpec, FailureKind, KnownGoodSet, RolloutRecord, RolloutState,
    StageKind, StageResult, StageStatus, TerminationReason, ValidationError, epoch_ms,
};
use deploy_health::CancelSignal;

use crate::collaborators::Collaborators;
use crate::executor::{Stage, StageContext, StageExecutor};
use crate::rollback::{RollbackController, RollbackPlan};

static ROLLOUT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_rollout_id(environment: &str, started_at_ms: u64) -> String {
    let seq = ROLLOUT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{environment}-{started_at_ms}-{seq}")
}

/// The stages a valid spec would run, in order, on the happy path.
pub fn planned_stages(spec: &DeploymentSpec) -> Result<Vec<StageKind>, ValidationError> {
    let order = spec.validate()?;
    let mut stages = vec![StageKind::QualityGate, StageKind::Build, StageKind::Publish];
    for resource in &order {
        stages.push(StageKind::Apply(resource.name.clone()));
        if resource.wait_ready {
            stages.push(StageKind::WaitReady(resource.name.clone()));
        }
    }
    stages.push(StageKind::Probe);
    Ok(stages)
}

/// One rollout in progress. Sole owner of its record.
struct Rollout<'a> {
    record: RolloutRecord,
    collaborators: &'a Collaborators,
}

impl<'a> Rollout<'a> {
    fn begin(spec: DeploymentSpec, collaborators: &'a Collaborators) -> Self {
        let started_at_ms = epoch_ms();
        let record = RolloutRecord {
            id: next_rollout_id(&spec.target.environment, started_at_ms),
            spec,
            state: RolloutState::Pending,
            stages: Vec::new(),
            applied: Vec::new(),
            artifact: None,
            rollback_target: None,
            reason: None,
            started_at_ms,
            finished_at_ms: None,
        };
        info!(
            rollout = %record.id,
            environment = %record.environment(),
            deployment = %record.spec.name,
            "rollout started"
        );
        collaborators.notify(&record);
        Self {
            record,
            collaborators,
        }
    }

    fn transition(&mut self, next: RolloutState) {
        let from = self.record.state;
        debug_assert!(
            from.can_transition_to(next),
            "illegal rollout transition {from:?} -> {next:?}"
        );
        self.record.state = next;
        debug!(
            rollout = %self.record.id,
            from = from.label(),
            to = next.label(),
            "rollout transition"
        );
        self.collaborators.notify(&self.record);
    }

    fn push(&mut self, result: StageResult) {
        self.record.stages.push(result);
        self.collaborators.notify(&self.record);
    }

    fn finish(mut self, state: RolloutState, reason: Option<TerminationReason>) -> RolloutRecord {
        debug_assert!(
            self.record.state.can_transition_to(state),
            "illegal rollout transition {:?} -> {state:?}",
            self.record.state
        );
        self.record.state = state;
        self.record.reason = reason;
        self.record.finished_at_ms = Some(epoch_ms());

        match state {
            RolloutState::Succeeded => info!(
                rollout = %self.record.id,
                environment = %self.record.environment(),
                stages = self.record.stages.len(),
                "rollout succeeded"
            ),
            RolloutState::RollbackFailed => error!(
                rollout = %self.record.id,
                environment = %self.record.environment(),
                reason = ?self.record.reason.as_ref().map(|r| r.to_string()),
                "rollback failed; manual intervention required"
            ),
            _ => warn!(
                rollout = %self.record.id,
                environment = %self.record.environment(),
                state = state.label(),
                reason = ?self.record.reason.as_ref().map(|r| r.to_string()),
                "rollout ended"
            ),
        }

        self.collaborators.notify(&self.record);
        self.record
    }

    /// Whether the first resource apply has succeeded.
    fn past_committal_point(&self) -> bool {
        !self.record.applied.is_empty()
    }
}

/// Why a stage ended the rollout, as an operator-facing reason.
fn stage_reason(result: &StageResult) -> TerminationReason {
    let kind = result.failure.unwrap_or(match result.status {
        StageStatus::TimedOut => FailureKind::Timeout,
        StageStatus::Cancelled => FailureKind::Cancelled,
        _ => FailureKind::PermanentCollaborator,
    });
    TerminationReason::new(
        kind,
        format!("{} {}: {}", result.stage, result.status.label(), result.detail),
    )
}

/// Runs rollouts against a fixed set of collaborators.
///
/// Cheap to clone; independent rollouts may run concurrently on clones of
/// the same controller.
#[derive(Clone)]
pub struct RolloutController {
    collaborators: Collaborators,
}

impl RolloutController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    /// Execute `spec` to a terminal state.
    ///
    /// `known_good` is the environment's last fully-succeeded resource set;
    /// without one, failures past the committal point cannot be rolled back.
    /// Never returns an error: every outcome is a finalized record.
    pub async fn run(
        &self,
        spec: DeploymentSpec,
        known_good: Option<KnownGoodSet>,
        cancel: CancelSignal,
    ) -> RolloutRecord {
        let mut rollout = Rollout::begin(spec.clone(), &self.collaborators);

        let order = match spec.validate() {
            Ok(order) => order,
            Err(e) => return rollout.finish(RolloutState::Failed, Some(e.into())),
        };
        if cancel.is_cancelled() {
            return rollout.finish(
                RolloutState::Cancelled,
                Some(TerminationReason::new(
                    FailureKind::Cancelled,
                    "cancelled before start",
                )),
            );
        }

        let executor = StageExecutor::new(self.collaborators.clone(), spec.policy.clone());
        let ctx = StageContext {
            target: &spec.target,
            build: &spec.build,
            artifact: None,
            cancel,
        };

        // Building: quality gate, then build.
        rollout.transition(RolloutState::Building);
        let quality = executor.run(Stage::QualityGate, &ctx).await;
        match quality.status {
            StageStatus::Succeeded | StageStatus::Skipped => rollout.push(quality),
            StageStatus::Cancelled => {
                let reason = stage_reason(&quality);
                rollout.push(quality);
                return rollout.finish(RolloutState::Cancelled, Some(reason));
            }
            _ if spec.policy.strict_quality_gate => {
                let reason = stage_reason(&quality);
                rollout.push(quality);
                return rollout.finish(RolloutState::Failed, Some(reason));
            }
            _ => {
                warn!(
                    rollout = %rollout.record.id,
                    detail = %quality.detail,
                    "quality gate failed; continuing because the gate is not strict"
                );
                rollout.push(quality);
            }
        }

        let built = executor.run(Stage::Build, &ctx).await;
        let Some(built_artifact) = built.artifact.clone().filter(|_| built.succeeded()) else {
            return self.abort(rollout, built, known_good, &executor, &ctx).await;
        };
        rollout.push(built);

        // Publishing.
        rollout.transition(RolloutState::Publishing);
        let published = executor.run(Stage::Publish(&built_artifact), &ctx).await;
        let artifact: ArtifactRef = match published.artifact.clone() {
            Some(a) if published.succeeded() => a,
            _ => return self.abort(rollout, published, known_good, &executor, &ctx).await,
        };
        rollout.push(published);
        rollout.record.artifact = Some(artifact.clone());
        let ctx = StageContext {
            artifact: Some(&artifact),
            ..ctx
        };

        // Applying, one resource at a time in dependency order.
        rollout.transition(RolloutState::Applying);
        for resource in &order {
            let applied = executor.run(Stage::Apply(resource), &ctx).await;
            if !applied.succeeded() {
                return self.abort(rollout, applied, known_good, &executor, &ctx).await;
            }
            rollout.push(applied);
            rollout.record.applied.push(resource.name.clone());

            if resource.wait_ready {
                let ready = executor.run(Stage::WaitReady(resource), &ctx).await;
                if !ready.succeeded() {
                    return self.abort(rollout, ready, known_good, &executor, &ctx).await;
                }
                rollout.push(ready);
            }
        }

        // AwaitingHealth.
        rollout.transition(RolloutState::AwaitingHealth);
        let probe = executor.run(Stage::Probe(&spec.health), &ctx).await;
        if !probe.succeeded() {
            return self.abort(rollout, probe, known_good, &executor, &ctx).await;
        }
        rollout.push(probe);
        rollout.finish(RolloutState::Succeeded, None)
    }

    /// Record the failed stage and move to the right terminal state.
    async fn abort(
        &self,
        mut rollout: Rollout<'_>,
        failed: StageResult,
        known_good: Option<KnownGoodSet>,
        executor: &StageExecutor,
        ctx: &StageContext<'_>,
    ) -> RolloutRecord {
        let reason = stage_reason(&failed);
        let cancelled = failed.status == StageStatus::Cancelled;
        rollout.push(failed);

        if cancelled {
            return rollout.finish(RolloutState::Cancelled, Some(reason));
        }
        if !rollout.past_committal_point() {
            return rollout.finish(RolloutState::Failed, Some(reason));
        }
        if !rollout.record.spec.policy.rollback_enabled {
            return rollout.finish(
                RolloutState::Failed,
                Some(TerminationReason::new(
                    reason.kind,
                    format!("{}; rollback disabled", reason.message),
                )),
            );
        }
        let Some(known_good) = known_good else {
            return rollout.finish(
                RolloutState::Failed,
                Some(TerminationReason::new(
                    reason.kind,
                    format!("{}; no known-good set to roll back to", reason.message),
                )),
            );
        };

        let plan = match RollbackPlan::new(&rollout.record.applied, &known_good) {
            Ok(plan) if plan.restore.is_empty() => {
                return rollout.finish(
                    RolloutState::Failed,
                    Some(TerminationReason::new(
                        reason.kind,
                        format!(
                            "{}; known-good set {} has no version of {}, left in place",
                            reason.message,
                            known_good.rollout_id,
                            plan.left_in_place.join(", ")
                        ),
                    )),
                );
            }
            Ok(plan) => {
                rollout.transition(RolloutState::RollingBack);
                plan
            }
            Err(e) => {
                rollout.transition(RolloutState::RollingBack);
                return rollout.finish(
                    RolloutState::RollbackFailed,
                    Some(TerminationReason::new(
                        FailureKind::Rollback,
                        format!("known-good set {} is unusable: {e}", known_good.rollout_id),
                    )),
                );
            }
        };
        rollout.record.rollback_target = Some(plan.restore.clone());

        let result = RollbackController::new(executor).rollback(&plan, ctx).await;
        let restored = result.succeeded();
        let detail = result.detail.clone();
        rollout.push(result);

        if restored {
            rollout.finish(
                RolloutState::RolledBack,
                Some(TerminationReason::new(
                    reason.kind,
                    format!(
                        "{}; rolled back to {} ({detail})",
                        reason.message, known_good.rollout_id
                    ),
                )),
            )
        } else {
            rollout.finish(
                RolloutState::RollbackFailed,
                Some(TerminationReason::new(
                    FailureKind::Rollback,
                    format!("{detail} (after {})", reason.message),
                )),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use deploy_core::{
        BuildContext, CollaboratorError, DeployTarget, HealthCheckSpec, ResourceDescriptor,
        RolloutPolicy, SuccessCondition,
    };
    use deploy_health::ProbeStatus;

    use crate::memory::{MemoryApplier, MemoryBuilder, MemoryQuality, MemorySink, ScriptedProber};

    fn spec(environment: &str) -> DeploymentSpec {
        DeploymentSpec {
            name: "chatbot".to_string(),
            target: DeployTarget {
                environment: environment.to_string(),
                namespace: format!("chatbot-{environment}"),
            },
            build: BuildContext {
                path: ".".to_string(),
                image: "registry.local/chatbot".to_string(),
            },
            resources: vec![
                ResourceDescriptor::new("namespace", "k8s/namespace.yaml"),
                ResourceDescriptor::new("config", "k8s/configmap.yaml").depends_on("namespace"),
                ResourceDescriptor::new("workload", "k8s/deployment.yaml")
                    .depends_on("config")
                    .wait_ready(),
            ],
            health: HealthCheckSpec {
                endpoint: "http://chatbot/health".to_string(),
                expect: SuccessCondition::default(),
                poll_interval: Duration::from_secs(1),
                deadline: Duration::from_secs(10),
                probe_timeout: Duration::from_secs(1),
            },
            policy: RolloutPolicy {
                max_retries: 1,
                backoff_base: Duration::from_millis(100),
                backoff_cap: Duration::from_millis(100),
                ready_poll_interval: Duration::from_millis(100),
                ..Default::default()
            },
        }
    }

    struct Harness {
        builder: Arc<MemoryBuilder>,
        applier: Arc<MemoryApplier>,
        sink: Arc<MemorySink>,
        collaborators: Collaborators,
    }

    fn harness(prober: ScriptedProber) -> Harness {
        let builder = Arc::new(MemoryBuilder::with_tag("v2"));
        let applier = Arc::new(MemoryApplier::new());
        let sink = Arc::new(MemorySink::new());
        let collaborators = Collaborators::new(builder.clone(), applier.clone(), Arc::new(prober))
            .with_sink(sink.clone());
        Harness {
            builder,
            applier,
            sink,
            collaborators,
        }
    }

    impl Harness {
        fn controller(&self) -> RolloutController {
            RolloutController::new(self.collaborators.clone())
        }
    }

    fn known_good() -> KnownGoodSet {
        KnownGoodSet {
            environment: "staging".to_string(),
            resources: spec("staging").resources,
            artifact: Some(ArtifactRef("registry.local/chatbot:v1".to_string())),
            rollout_id: "staging-1-0".to_string(),
            recorded_at_ms: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_walks_every_state() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));

        let record = h
            .controller()
            .run(spec("staging"), None, CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Succeeded);
        assert_eq!(record.reason, None);
        assert_eq!(record.applied, ["namespace", "config", "workload"]);
        assert_eq!(
            record.artifact,
            Some(ArtifactRef("registry.local/chatbot:v2".to_string()))
        );
        let kinds: Vec<StageKind> = record.stages.iter().map(|s| s.stage.clone()).collect();
        assert_eq!(kinds, planned_stages(&spec("staging")).unwrap());
        assert_eq!(
            h.sink.states(),
            [
                RolloutState::Pending,
                RolloutState::Building,
                RolloutState::Publishing,
                RolloutState::Applying,
                RolloutState::AwaitingHealth,
                RolloutState::Succeeded,
            ]
        );
        assert!(record.known_good().is_some());
        assert!(record.finished_at_ms.is_some());
    }

    #[tokio::test]
    async fn validation_failure_has_no_side_effects() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        let mut bad = spec("staging");
        bad.resources[0] = ResourceDescriptor::new("namespace", "k8s/namespace.yaml")
            .depends_on("workload");

        let record = h.controller().run(bad, None, CancelSignal::never()).await;

        assert_eq!(record.state, RolloutState::Failed);
        assert_eq!(record.reason.unwrap().kind, FailureKind::Validation);
        assert!(record.stages.is_empty());
        assert_eq!(h.builder.build_calls(), 0);
        assert_eq!(h.applier.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_fails_without_rollback() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.builder
            .fail_builds(1, CollaboratorError::permanent("Dockerfile not found"));

        let record = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        let reason = record.reason.unwrap();
        assert_eq!(reason.kind, FailureKind::PermanentCollaborator);
        assert!(reason.message.contains("Dockerfile not found"), "{reason}");
        assert_eq!(h.applier.calls(), 0);
        assert!(record.rollback_target.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_exhausted_fails_before_apply() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.builder
            .fail_publishes(2, CollaboratorError::transient("registry unavailable"));

        let record = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert_eq!(record.reason.as_ref().unwrap().kind, FailureKind::TransientCollaborator);
        let publish = record.stages_of(&StageKind::Publish).next().unwrap();
        assert_eq!(publish.status, StageStatus::Failed);
        assert_eq!(publish.attempts, 2);
        assert_eq!(h.builder.publish_calls(), 2);
        assert_eq!(h.applier.calls(), 0);
        assert!(record.rollback_target.is_none());
        assert!(!h.sink.states().contains(&RolloutState::RollingBack));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_publish_error_is_not_retried() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.builder
            .fail_publishes(1, CollaboratorError::permanent("access denied"));

        let record = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert_eq!(record.reason.unwrap().kind, FailureKind::PermanentCollaborator);
        assert_eq!(h.builder.publish_calls(), 1);
        assert_eq!(h.applier.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn known_good_without_applied_resources_means_failed() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier
            .fail_on("workload", CollaboratorError::permanent("invalid spec"));
        let unrelated = KnownGoodSet {
            resources: vec![ResourceDescriptor::new("legacy", "k8s/legacy.yaml")],
            ..known_good()
        };

        let record = h
            .controller()
            .run(spec("staging"), Some(unrelated), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        let reason = record.reason.as_ref().unwrap();
        assert!(reason.message.contains("namespace, config"), "{reason}");
        assert!(reason.message.contains("left in place"), "{reason}");
        assert!(record.stages_of(&StageKind::Rollback).next().is_none());
        assert!(!h.sink.states().contains(&RolloutState::RollingBack));
        assert_eq!(h.applier.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn first_apply_failure_is_before_committal_point() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier
            .fail_on("namespace", CollaboratorError::permanent("forbidden"));

        let record = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert!(record.applied.is_empty());
        assert!(!h.sink.states().contains(&RolloutState::RollingBack));
    }

    #[tokio::test(start_paused = true)]
    async fn no_known_good_set_means_failed() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier
            .fail_on("workload", CollaboratorError::permanent("invalid spec"));

        let record = h
            .controller()
            .run(spec("staging"), None, CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert!(
            record
                .reason
                .unwrap()
                .message
                .contains("no known-good set")
        );
        assert_eq!(record.applied, ["namespace", "config"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_disabled_means_failed() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier
            .fail_on("workload", CollaboratorError::permanent("invalid spec"));
        let mut spec = spec("staging");
        spec.policy.rollback_enabled = false;

        let record = h
            .controller()
            .run(spec, Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert!(record.reason.unwrap().message.contains("rollback disabled"));
        assert_eq!(h.applier.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_deploy_rolls_back_everything_applied() {
        let h = harness(ScriptedProber::always(ProbeStatus::Unhealthy));

        let record = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::RolledBack);
        let reason = record.reason.as_ref().unwrap();
        assert_eq!(reason.kind, FailureKind::Timeout);
        assert!(reason.message.contains("staging-1-0"), "{reason}");
        let restored: Vec<&str> = record
            .rollback_target
            .as_ref()
            .unwrap()
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(restored, ["namespace", "config", "workload"]);
        assert_eq!(
            h.applier.live_artifact("workload"),
            Some(ArtifactRef("registry.local/chatbot:v1".to_string()))
        );
        assert_eq!(record.stages.last().unwrap().stage, StageKind::Rollback);
    }

    #[tokio::test(start_paused = true)]
    async fn redeploy_after_rollback_applies_the_new_artifact() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier
            .fail_on("workload", CollaboratorError::permanent("quota exceeded"));
        let first = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;
        assert_eq!(first.state, RolloutState::RolledBack);

        h.applier.clear_failures();
        let second = h
            .controller()
            .run(spec("staging"), Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(second.state, RolloutState::Succeeded);
        let workload: Vec<_> = h
            .applier
            .applications()
            .into_iter()
            .filter(|a| a.resource == "workload")
            .collect();
        assert_eq!(workload.len(), 1);
        assert_eq!(
            workload[0].artifact,
            Some(ArtifactRef("registry.local/chatbot:v2".to_string()))
        );
        assert_eq!(workload[0].outcome, crate::collaborators::ApplyOutcome::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_ready_timeout_triggers_rollback() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        h.applier.not_ready_for("workload", u32::MAX);
        let mut spec = spec("staging");
        spec.policy.stage_timeout = Duration::from_secs(5);

        let record = h
            .controller()
            .run(spec, Some(known_good()), CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::RolledBack);
        let failed = record
            .stages_of(&StageKind::WaitReady("workload".to_string()))
            .next()
            .unwrap();
        assert_eq!(failed.status, StageStatus::TimedOut);
    }

    #[tokio::test]
    async fn strict_quality_gate_stops_before_build() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        let collaborators = h.collaborators.clone().with_quality(Arc::new(
            MemoryQuality::failing(CollaboratorError::permanent("lint errors")),
        ));

        let record = RolloutController::new(collaborators)
            .run(spec("staging"), None, CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Failed);
        assert_eq!(record.stages.len(), 1);
        assert_eq!(h.builder.build_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lenient_quality_gate_continues() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        let collaborators = h.collaborators.clone().with_quality(Arc::new(
            MemoryQuality::failing(CollaboratorError::permanent("lint errors")),
        ));
        let mut spec = spec("staging");
        spec.policy.strict_quality_gate = false;

        let record = RolloutController::new(collaborators)
            .run(spec, None, CancelSignal::never())
            .await;

        assert_eq!(record.state, RolloutState::Succeeded);
        let gate = record.stages_of(&StageKind::QualityGate).next().unwrap();
        assert_eq!(gate.status, StageStatus::Failed);
    }

    #[tokio::test]
    async fn already_cancelled_runs_nothing() {
        let h = harness(ScriptedProber::always(ProbeStatus::Healthy));
        let (handle, signal) = deploy_health::cancel_pair();
        handle.cancel();

        let record = h.controller().run(spec("staging"), None, signal).await;

        assert_eq!(record.state, RolloutState::Cancelled);
        assert_eq!(h.builder.build_calls(), 0);
    }

    #[test]
    fn rollout_ids_are_unique() {
        let a = next_rollout_id("prod", 5);
        let b = next_rollout_id("prod", 5);
        assert_ne!(a, b);
        assert!(a.starts_with("prod-5-"));
    }
}
