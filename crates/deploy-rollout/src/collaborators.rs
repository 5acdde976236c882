//! External collaborator contracts.
//!
//! The orchestrator never shells out or talks to a cluster itself; it calls
//! these traits. Implementations report failures as [`CollaboratorError`]
//! and mark whether another attempt could succeed.

use std::sync::Arc;

use async_trait::async_trait;

use deploy_core::{
    ArtifactRef, BuildContext, CollaboratorError, DeployTarget, ResourceDescriptor, RolloutRecord,
};
use deploy_health::HealthProber;

/// Produces and publishes artifacts.
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    /// Build the context into a content-addressed artifact.
    async fn build(
        &self,
        target: &DeployTarget,
        context: &BuildContext,
    ) -> Result<ArtifactRef, CollaboratorError>;

    /// Push the artifact where the cluster can pull it. Returns the
    /// reference the cluster should use.
    async fn publish(
        &self,
        target: &DeployTarget,
        artifact: &ArtifactRef,
    ) -> Result<ArtifactRef, CollaboratorError>;
}

/// What an apply changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Configured,
    /// The live object already matched the descriptor.
    Unchanged,
}

impl ApplyOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Configured => "configured",
            ApplyOutcome::Unchanged => "unchanged",
        }
    }
}

/// Makes cluster state match one resource descriptor. Must be idempotent.
#[async_trait]
pub trait ResourceApplier: Send + Sync {
    async fn apply(
        &self,
        target: &DeployTarget,
        resource: &ResourceDescriptor,
        artifact: Option<&ArtifactRef>,
    ) -> Result<ApplyOutcome, CollaboratorError>;

    /// Whether an applied resource has converged. Resources without a
    /// readiness notion are ready as soon as they are applied.
    async fn ready(
        &self,
        _target: &DeployTarget,
        _resource: &ResourceDescriptor,
    ) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}

/// Pre-build checks (tests, linters) gated by `strict_quality_gate`.
#[async_trait]
pub trait QualityChecker: Send + Sync {
    async fn check(
        &self,
        target: &DeployTarget,
        context: &BuildContext,
    ) -> Result<(), CollaboratorError>;
}

/// Fire-and-forget observer of rollout progress. Must not block; errors
/// are the sink's own business.
pub trait NotificationSink: Send + Sync {
    fn record(&self, record: &RolloutRecord);
}

/// The set of collaborators a rollout calls, shared read-only between
/// concurrent rollouts.
#[derive(Clone)]
pub struct Collaborators {
    pub builder: Arc<dyn ArtifactBuilder>,
    pub applier: Arc<dyn ResourceApplier>,
    pub prober: Arc<dyn HealthProber>,
    pub quality: Option<Arc<dyn QualityChecker>>,
    pub sinks: Vec<Arc<dyn NotificationSink>>,
}

impl Collaborators {
    pub fn new(
        builder: Arc<dyn ArtifactBuilder>,
        applier: Arc<dyn ResourceApplier>,
        prober: Arc<dyn HealthProber>,
    ) -> Self {
        Self {
            builder,
            applier,
            prober,
            quality: None,
            sinks: Vec::new(),
        }
    }

    pub fn with_quality(mut self, checker: Arc<dyn QualityChecker>) -> Self {
        self.quality = Some(checker);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub(crate) fn notify(&self, record: &RolloutRecord) {
        for sink in &self.sinks {
            sink.record(record);
        }
    }
}
