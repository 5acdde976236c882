//! Stage executor — runs one orchestration stage under the rollout policy.
//!
//! Every stage makes exactly one collaborator call per attempt. Retryable
//! failures are retried with exponential backoff; the stage timeout bounds
//! all attempts together. Collaborator errors never escape this module:
//! they are folded into the returned [`StageResult`].

use std::future::Future;

use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use deploy_core::{
    ArtifactRef, BuildContext, CollaboratorError, DeployTarget, FailureKind, HealthCheckSpec,
    ResourceDescriptor, RolloutPolicy, StageKind, StageResult, StageStatus, epoch_ms,
};
use deploy_health::{CancelSignal, HealthGate, HealthOutcome};

use crate::collaborators::Collaborators;

/// A stage to run, borrowing its inputs from the rollout.
#[derive(Debug, Clone, Copy)]
pub enum Stage<'a> {
    QualityGate,
    Build,
    Publish(&'a ArtifactRef),
    Apply(&'a ResourceDescriptor),
    WaitReady(&'a ResourceDescriptor),
    Probe(&'a HealthCheckSpec),
}

impl Stage<'_> {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::QualityGate => StageKind::QualityGate,
            Stage::Build => StageKind::Build,
            Stage::Publish(_) => StageKind::Publish,
            Stage::Apply(r) => StageKind::Apply(r.name.clone()),
            Stage::WaitReady(r) => StageKind::WaitReady(r.name.clone()),
            Stage::Probe(_) => StageKind::Probe,
        }
    }
}

/// Per-rollout inputs threaded into every collaborator call.
#[derive(Debug, Clone)]
pub struct StageContext<'a> {
    pub target: &'a DeployTarget,
    pub build: &'a BuildContext,
    /// Artifact the applier should reference, once known.
    pub artifact: Option<&'a ArtifactRef>,
    pub cancel: CancelSignal,
}

/// Successful attempt payload.
struct Attempt {
    detail: String,
    artifact: Option<ArtifactRef>,
}

/// Runs stages for one rollout policy.
#[derive(Clone)]
pub struct StageExecutor {
    collaborators: Collaborators,
    policy: RolloutPolicy,
    gate: HealthGate,
}

impl StageExecutor {
    pub fn new(collaborators: Collaborators, policy: RolloutPolicy) -> Self {
        let gate = HealthGate::new(collaborators.prober.clone());
        Self {
            collaborators,
            policy,
            gate,
        }
    }

    /// Run one stage to completion and report its result.
    pub async fn run(&self, stage: Stage<'_>, ctx: &StageContext<'_>) -> StageResult {
        let kind = stage.kind();
        debug!(environment = %ctx.target.environment, stage = %kind, "stage starting");

        let result = match stage {
            Stage::QualityGate => match &self.collaborators.quality {
                None => finish(
                    kind,
                    StageStatus::Skipped,
                    "no quality checks configured".to_string(),
                    epoch_ms(),
                    0,
                ),
                Some(checker) => {
                    self.with_retries(kind, ctx, move || async move {
                        checker.check(ctx.target, ctx.build).await?;
                        Ok(Attempt {
                            detail: "quality checks passed".to_string(),
                            artifact: None,
                        })
                    })
                    .await
                }
            },
            Stage::Build => {
                let builder = &self.collaborators.builder;
                self.with_retries(kind, ctx, move || async move {
                    let artifact = builder.build(ctx.target, ctx.build).await?;
                    Ok(Attempt {
                        detail: format!("built {artifact}"),
                        artifact: Some(artifact),
                    })
                })
                .await
            }
            Stage::Publish(artifact) => {
                let builder = &self.collaborators.builder;
                self.with_retries(kind, ctx, move || async move {
                    let published = builder.publish(ctx.target, artifact).await?;
                    Ok(Attempt {
                        detail: format!("published {published}"),
                        artifact: Some(published),
                    })
                })
                .await
            }
            Stage::Apply(resource) => {
                let applier = &self.collaborators.applier;
                self.with_retries(kind, ctx, move || async move {
                    let outcome = applier.apply(ctx.target, resource, ctx.artifact).await?;
                    Ok(Attempt {
                        detail: format!("{} {}", resource.name, outcome.label()),
                        artifact: None,
                    })
                })
                .await
            }
            Stage::WaitReady(resource) => self.wait_ready(kind, resource, ctx).await,
            Stage::Probe(check) => self.probe(kind, check, ctx).await,
        };

        match result.status {
            StageStatus::Succeeded | StageStatus::Skipped => {
                info!(
                    environment = %ctx.target.environment,
                    stage = %result.stage,
                    attempts = result.attempts,
                    detail = %result.detail,
                    "stage {}", result.status.label()
                );
            }
            _ => {
                warn!(
                    environment = %ctx.target.environment,
                    stage = %result.stage,
                    attempts = result.attempts,
                    detail = %result.detail,
                    "stage {}", result.status.label()
                );
            }
        }
        result
    }

    /// Retry `attempt` on retryable errors until success, a permanent
    /// error, retry exhaustion, the stage deadline, or cancellation.
    async fn with_retries<F, Fut>(
        &self,
        kind: StageKind,
        ctx: &StageContext<'_>,
        mut attempt: F,
    ) -> StageResult
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt, CollaboratorError>>,
    {
        let started_at = epoch_ms();
        let deadline = Instant::now() + self.policy.stage_timeout;
        let mut cancel = ctx.cancel.clone();
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return cancelled(kind, started_at, attempts);
            }

            attempts += 1;
            let error = match timeout_at(deadline, attempt()).await {
                Err(_) => {
                    return finish(
                        kind,
                        StageStatus::TimedOut,
                        format!(
                            "no result within {:?} ({attempts} attempt(s))",
                            self.policy.stage_timeout
                        ),
                        started_at,
                        attempts,
                    );
                }
                Ok(Ok(done)) => {
                    return StageResult {
                        artifact: done.artifact,
                        ..finish(kind, StageStatus::Succeeded, done.detail, started_at, attempts)
                    };
                }
                Ok(Err(e)) => e,
            };

            if !error.retryable {
                return failed(
                    kind,
                    FailureKind::PermanentCollaborator,
                    error.message,
                    started_at,
                    attempts,
                );
            }
            if attempts > self.policy.max_retries {
                return failed(
                    kind,
                    FailureKind::TransientCollaborator,
                    format!("gave up after {attempts} attempt(s): {}", error.message),
                    started_at,
                    attempts,
                );
            }

            let delay = self.policy.backoff_for(attempts);
            warn!(
                environment = %ctx.target.environment,
                stage = %kind,
                attempt = attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "retryable failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(kind, started_at, attempts),
                _ = sleep_until(deadline) => {
                    return finish(
                        kind,
                        StageStatus::TimedOut,
                        format!(
                            "no result within {:?} ({attempts} attempt(s), last error: {})",
                            self.policy.stage_timeout, error.message
                        ),
                        started_at,
                        attempts,
                    );
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// Poll the applier's readiness query until the resource converges.
    /// A not-ready answer costs no retry; a retryable error does.
    async fn wait_ready(
        &self,
        kind: StageKind,
        resource: &ResourceDescriptor,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let started_at = epoch_ms();
        let deadline = Instant::now() + self.policy.stage_timeout;
        let mut cancel = ctx.cancel.clone();
        let mut attempts = 0u32;
        let mut retries = 0u32;

        loop {
            if cancel.is_cancelled() {
                return cancelled(kind, started_at, attempts);
            }

            attempts += 1;
            let pause = match timeout_at(
                deadline,
                self.collaborators.applier.ready(ctx.target, resource),
            )
            .await
            {
                Err(_) => break,
                Ok(Ok(true)) => {
                    return finish(
                        kind,
                        StageStatus::Succeeded,
                        format!("{} ready after {attempts} check(s)", resource.name),
                        started_at,
                        attempts,
                    );
                }
                Ok(Ok(false)) => {
                    debug!(resource = %resource.name, attempts, "resource not ready yet");
                    self.policy.ready_poll_interval
                }
                Ok(Err(e)) if !e.retryable => {
                    return failed(
                        kind,
                        FailureKind::PermanentCollaborator,
                        e.message,
                        started_at,
                        attempts,
                    );
                }
                Ok(Err(e)) => {
                    retries += 1;
                    if retries > self.policy.max_retries {
                        return failed(
                            kind,
                            FailureKind::TransientCollaborator,
                            format!("gave up after {retries} failed check(s): {}", e.message),
                            started_at,
                            attempts,
                        );
                    }
                    warn!(resource = %resource.name, error = %e, "readiness check failed, retrying");
                    self.policy.backoff_for(retries)
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(kind, started_at, attempts),
                _ = sleep_until(deadline) => break,
                _ = sleep(pause) => {}
            }
        }

        finish(
            kind,
            StageStatus::TimedOut,
            format!(
                "{} not ready within {:?} ({attempts} check(s))",
                resource.name, self.policy.stage_timeout
            ),
            started_at,
            attempts,
        )
    }

    /// Delegate to the health gate.
    async fn probe(
        &self,
        kind: StageKind,
        check: &HealthCheckSpec,
        ctx: &StageContext<'_>,
    ) -> StageResult {
        let started_at = epoch_ms();
        let report = self
            .gate
            .await_healthy(ctx.target, check, ctx.cancel.clone())
            .await;
        let detail = report.describe(check);
        match report.outcome {
            HealthOutcome::Healthy => {
                finish(kind, StageStatus::Succeeded, detail, started_at, report.probes)
            }
            HealthOutcome::DeadlineExceeded => {
                finish(kind, StageStatus::TimedOut, detail, started_at, report.probes)
            }
            HealthOutcome::Cancelled => {
                finish(kind, StageStatus::Cancelled, detail, started_at, report.probes)
            }
            HealthOutcome::ProbeFailed(_) => failed(
                kind,
                FailureKind::PermanentCollaborator,
                detail,
                started_at,
                report.probes,
            ),
        }
    }
}

/// Assemble a result; timeouts and cancellations carry their failure kind.
pub(crate) fn finish(
    kind: StageKind,
    status: StageStatus,
    detail: String,
    started_at_ms: u64,
    attempts: u32,
) -> StageResult {
    let failure = match status {
        StageStatus::TimedOut => Some(FailureKind::Timeout),
        StageStatus::Cancelled => Some(FailureKind::Cancelled),
        _ => None,
    };
    StageResult {
        resource: kind.resource().map(str::to_string),
        stage: kind,
        status,
        detail,
        started_at_ms,
        finished_at_ms: epoch_ms(),
        attempts,
        artifact: None,
        failure,
    }
}

fn failed(
    kind: StageKind,
    failure: FailureKind,
    detail: String,
    started_at_ms: u64,
    attempts: u32,
) -> StageResult {
    StageResult {
        failure: Some(failure),
        ..finish(kind, StageStatus::Failed, detail, started_at_ms, attempts)
    }
}

fn cancelled(kind: StageKind, started_at_ms: u64, attempts: u32) -> StageResult {
    finish(
        kind,
        StageStatus::Cancelled,
        "cancelled by caller".to_string(),
        started_at_ms,
        attempts,
    )
}
