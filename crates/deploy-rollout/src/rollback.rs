//! Rollback controller — restores the known-good resource set.
//!
//! Only resources the failed rollout actually touched are restored; a
//! resource that was never applied still holds its prior state. Restoring
//! goes through the same Apply stage the rollout uses, in dependency order,
//! and stops at the first resource that cannot be restored.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{error, info, warn};

use deploy_core::{
    ArtifactRef, FailureKind, GraphError, KnownGoodSet, ResourceDescriptor, StageKind,
    StageResult, StageStatus, epoch_ms, topological_order,
};
use deploy_health::CancelSignal;

use crate::executor::{Stage, StageContext, StageExecutor, finish};

/// What a rollback will re-apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Known-good descriptors to re-apply, in dependency order.
    pub restore: Vec<ResourceDescriptor>,
    /// Applied resources the known-good set has no prior version of.
    pub left_in_place: Vec<String>,
    /// Artifact the known-good resources referenced.
    pub artifact: Option<ArtifactRef>,
}

impl RollbackPlan {
    /// Restrict `known_good` to the resources in `applied`.
    ///
    /// Dependencies on resources outside the restored subset are already
    /// satisfied in the cluster, so those edges are dropped before ordering.
    pub fn new(applied: &[String], known_good: &KnownGoodSet) -> Result<Self, GraphError> {
        let touched: BTreeSet<&str> = applied.iter().map(String::as_str).collect();
        let originals: BTreeMap<&str, &ResourceDescriptor> = known_good
            .resources
            .iter()
            .filter(|r| touched.contains(r.name.as_str()))
            .map(|r| (r.name.as_str(), r))
            .collect();

        let pruned: Vec<ResourceDescriptor> = originals
            .values()
            .map(|r| ResourceDescriptor {
                depends_on: r
                    .depends_on
                    .iter()
                    .filter(|d| originals.contains_key(d.as_str()))
                    .cloned()
                    .collect(),
                ..(*r).clone()
            })
            .collect();

        let restore = topological_order(&pruned)?
            .into_iter()
            .filter_map(|r| originals.get(r.name.as_str()).map(|orig| (*orig).clone()))
            .collect();

        let left_in_place = applied
            .iter()
            .filter(|name| !originals.contains_key(name.as_str()))
            .cloned()
            .collect();

        Ok(Self {
            restore,
            left_in_place,
            artifact: known_good.artifact.clone(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.restore.iter().map(|r| r.name.clone()).collect()
    }
}

/// Re-applies a [`RollbackPlan`] through a [`StageExecutor`].
pub struct RollbackController<'a> {
    executor: &'a StageExecutor,
}

impl<'a> RollbackController<'a> {
    pub fn new(executor: &'a StageExecutor) -> Self {
        Self { executor }
    }

    /// Restore every resource in the plan. Returns one aggregate Rollback
    /// stage result; on failure, `resource` names the first resource that
    /// could not be restored.
    ///
    /// Rollback ignores caller cancellation: once started, stopping half
    /// way would leave the environment in neither version.
    pub async fn rollback(&self, plan: &RollbackPlan, ctx: &StageContext<'_>) -> StageResult {
        let started_at = epoch_ms();
        let ctx = StageContext {
            artifact: plan.artifact.as_ref(),
            cancel: CancelSignal::never(),
            ..ctx.clone()
        };
        let mut attempts = 0u32;

        info!(
            environment = %ctx.target.environment,
            restore = ?plan.names(),
            left_in_place = ?plan.left_in_place,
            "rolling back to known-good set"
        );

        for resource in &plan.restore {
            let result = self.executor.run(Stage::Apply(resource), &ctx).await;
            attempts += result.attempts;
            if !result.succeeded() {
                error!(
                    environment = %ctx.target.environment,
                    resource = %resource.name,
                    detail = %result.detail,
                    "rollback could not restore resource"
                );
                return StageResult {
                    resource: Some(resource.name.clone()),
                    failure: Some(FailureKind::Rollback),
                    ..finish(
                        StageKind::Rollback,
                        StageStatus::Failed,
                        format!("could not restore {}: {}", resource.name, result.detail),
                        started_at,
                        attempts,
                    )
                };
            }
        }

        if !plan.left_in_place.is_empty() {
            warn!(
                environment = %ctx.target.environment,
                resources = ?plan.left_in_place,
                "no known-good version; left in place"
            );
        }

        let mut detail = format!("restored {} resource(s)", plan.restore.len());
        if !plan.left_in_place.is_empty() {
            detail.push_str(&format!(
                "; left in place: {}",
                plan.left_in_place.join(", ")
            ));
        }
        StageResult {
            artifact: plan.artifact.clone(),
            ..finish(
                StageKind::Rollback,
                StageStatus::Succeeded,
                detail,
                started_at,
                attempts,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use deploy_core::{BuildContext, CollaboratorError, DeployTarget, RolloutPolicy};
    use deploy_health::ProbeStatus;

    use crate::collaborators::Collaborators;
    use crate::memory::{MemoryApplier, MemoryBuilder, ScriptedProber};

    fn known_good() -> KnownGoodSet {
        KnownGoodSet {
            environment: "prod".to_string(),
            resources: vec![
                ResourceDescriptor::new("namespace", "k8s/namespace.yaml"),
                ResourceDescriptor::new("config", "k8s/configmap.yaml").depends_on("namespace"),
                ResourceDescriptor::new("workload", "k8s/deployment.yaml")
                    .depends_on("namespace")
                    .depends_on("config"),
                ResourceDescriptor::new("network-exposure", "k8s/service.yaml")
                    .depends_on("workload"),
            ],
            artifact: Some(ArtifactRef("chatbot:v1".to_string())),
            rollout_id: "prod-1-0".to_string(),
            recorded_at_ms: 1,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plan_restricts_to_applied_resources() {
        let plan = RollbackPlan::new(&names(&["config", "namespace"]), &known_good()).unwrap();
        assert_eq!(plan.names(), ["namespace", "config"]);
        assert!(plan.left_in_place.is_empty());
        assert_eq!(plan.artifact, Some(ArtifactRef("chatbot:v1".to_string())));
    }

    #[test]
    fn plan_drops_edges_outside_the_subset() {
        let plan = RollbackPlan::new(&names(&["network-exposure", "config"]), &known_good()).unwrap();
        assert_eq!(plan.names(), ["config", "network-exposure"]);
        // Original descriptors are restored unchanged.
        assert!(plan.restore[1].depends_on.contains("workload"));
    }

    #[test]
    fn plan_reports_resources_without_prior_version() {
        let plan = RollbackPlan::new(&names(&["namespace", "autoscaler"]), &known_good()).unwrap();
        assert_eq!(plan.names(), ["namespace"]);
        assert_eq!(plan.left_in_place, ["autoscaler"]);
    }

    struct Fixture {
        applier: Arc<MemoryApplier>,
        executor: StageExecutor,
        target: DeployTarget,
        build: BuildContext,
    }

    fn fixture() -> Fixture {
        let applier = Arc::new(MemoryApplier::new());
        let collaborators = Collaborators::new(
            Arc::new(MemoryBuilder::new()),
            applier.clone(),
            Arc::new(ScriptedProber::always(ProbeStatus::Healthy)),
        );
        let policy = RolloutPolicy {
            max_retries: 1,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(10),
            ..Default::default()
        };
        Fixture {
            applier,
            executor: StageExecutor::new(collaborators, policy),
            target: DeployTarget {
                environment: "prod".to_string(),
                namespace: "chatbot-prod".to_string(),
            },
            build: BuildContext {
                path: ".".to_string(),
                image: "chatbot".to_string(),
            },
        }
    }

    impl Fixture {
        fn ctx(&self) -> StageContext<'_> {
            StageContext {
                target: &self.target,
                build: &self.build,
                artifact: None,
                cancel: CancelSignal::never(),
            }
        }
    }

    #[tokio::test]
    async fn restores_with_known_good_artifact() {
        let fx = fixture();
        let plan = RollbackPlan::new(&names(&["namespace", "config"]), &known_good()).unwrap();

        let result = RollbackController::new(&fx.executor)
            .rollback(&plan, &fx.ctx())
            .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.stage, StageKind::Rollback);
        assert_eq!(result.attempts, 2);
        assert_eq!(fx.applier.applied(), ["namespace", "config"]);
        assert_eq!(
            fx.applier.live_artifact("config"),
            Some(ArtifactRef("chatbot:v1".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_unrestorable_resource() {
        let fx = fixture();
        fx.applier
            .fail_on("config", CollaboratorError::permanent("admission webhook denied"));
        let plan = RollbackPlan::new(
            &names(&["namespace", "config", "workload"]),
            &known_good(),
        )
        .unwrap();

        let result = RollbackController::new(&fx.executor)
            .rollback(&plan, &fx.ctx())
            .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.failure, Some(FailureKind::Rollback));
        assert_eq!(result.resource.as_deref(), Some("config"));
        assert!(result.detail.contains("admission webhook denied"));
        // Workload is never attempted and the rollback is not restarted.
        assert_eq!(fx.applier.applied(), ["namespace"]);
        assert_eq!(fx.applier.calls(), 2);
    }
}
