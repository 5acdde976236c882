//! Domain types shared by the orchestrator crates.
//!
//! Everything here is plain data: serializable to JSON for the history
//! store and cheap to clone into notification snapshots.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, ValidationError};
use crate::graph::topological_order;

/// Name of a resource within a deployment.
pub type ResourceName = String;

// ── Deployment input ───────────────────────────────────────────────

/// Content-addressed reference to a built artifact
/// (e.g. `registry.example.com/chatbot:sha-3f2a9c01d4e7`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a rollout lands. Passed to every collaborator call so nothing
/// depends on an ambient "current namespace".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployTarget {
    pub environment: String,
    pub namespace: String,
}

/// Input to the artifact builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildContext {
    /// Directory containing the build inputs.
    pub path: String,
    /// Image / artifact name without a tag.
    pub image: String,
}

/// A named declarative unit applied to the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: ResourceName,
    /// Names of resources that must be applied first.
    #[serde(default)]
    pub depends_on: BTreeSet<ResourceName>,
    /// Manifest path or inline document, handed verbatim to the applier.
    pub manifest: String,
    /// Whether a readiness wait follows the apply.
    #[serde(default)]
    pub wait_ready: bool,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, manifest: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: BTreeSet::new(),
            manifest: manifest.into(),
            wait_ready: false,
        }
    }

    /// Add a dependency edge.
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.insert(name.into());
        self
    }

    /// Require a readiness wait after applying.
    pub fn wait_ready(mut self) -> Self {
        self.wait_ready = true;
        self
    }
}

/// What counts as a healthy probe response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuccessCondition {
    /// Exact status code. `None` accepts any 2xx.
    pub status: Option<u16>,
    /// Substring the response body must contain.
    pub body_contains: Option<String>,
}

impl SuccessCondition {
    pub fn matches(&self, status: u16, body: &str) -> bool {
        let status_ok = match self.status {
            Some(expected) => status == expected,
            None => (200..300).contains(&status),
        };
        let body_ok = self
            .body_contains
            .as_deref()
            .is_none_or(|needle| body.contains(needle));
        status_ok && body_ok
    }
}

/// Health gate parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Endpoint to probe, e.g. `http://10.0.0.7:8000/health`.
    pub endpoint: String,
    pub expect: SuccessCondition,
    pub poll_interval: Duration,
    /// Total time the gate may wait for the first healthy probe.
    pub deadline: Duration,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
}

/// Timeouts, retries and rollback behaviour for a rollout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    /// Budget for one stage, all attempts included.
    pub stage_timeout: Duration,
    /// Retries after the first attempt for retryable failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub rollback_enabled: bool,
    /// Fail the rollout when the quality gate fails instead of warning.
    pub strict_quality_gate: bool,
    /// Poll interval for readiness waits.
    pub ready_poll_interval: Duration,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300),
            max_retries: 2,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            rollback_enabled: true,
            strict_quality_gate: true,
            ready_poll_interval: Duration::from_secs(2),
        }
    }
}

impl RolloutPolicy {
    /// Delay before retry number `retry` (1-based): base doubled per retry, capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }
}

/// Everything needed to run one rollout. Immutable once a rollout starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub name: String,
    pub target: DeployTarget,
    pub build: BuildContext,
    pub resources: Vec<ResourceDescriptor>,
    pub health: HealthCheckSpec,
    pub policy: RolloutPolicy,
}

impl DeploymentSpec {
    /// Check the spec and return its resources in apply order.
    pub fn validate(&self) -> Result<Vec<ResourceDescriptor>, ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::MissingField("name"));
        }
        if self.target.environment.trim().is_empty() {
            return Err(ValidationError::MissingField("environment"));
        }
        if self.target.environment.contains('/') {
            return Err(ValidationError::InvalidValue {
                field: "environment",
                reason: format!("`{}` must not contain `/`", self.target.environment),
            });
        }
        if self.target.namespace.trim().is_empty() {
            return Err(ValidationError::MissingField("namespace"));
        }
        if self.build.image.trim().is_empty() {
            return Err(ValidationError::MissingField("artifact.image"));
        }
        if self.health.endpoint.trim().is_empty() {
            return Err(ValidationError::MissingField("health.endpoint"));
        }
        if self.resources.is_empty() {
            return Err(ValidationError::MissingField("resources"));
        }
        if self.health.poll_interval.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "health.interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.health.deadline.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "health.deadline",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.health.probe_timeout.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "health.timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.policy.stage_timeout.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "policy.stage_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.policy.ready_poll_interval.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "policy.ready_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.policy.backoff_cap < self.policy.backoff_base {
            return Err(ValidationError::InvalidValue {
                field: "policy.backoff_cap",
                reason: "must not be smaller than policy.backoff_base".to_string(),
            });
        }
        Ok(topological_order(&self.resources)?)
    }
}

// ── Stage results ──────────────────────────────────────────────────

/// Which orchestration step a result belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "resource", rename_all = "snake_case")]
pub enum StageKind {
    QualityGate,
    Build,
    Publish,
    Apply(ResourceName),
    WaitReady(ResourceName),
    Probe,
    Rollback,
}

impl StageKind {
    /// Resource the stage concerns, if any.
    pub fn resource(&self) -> Option<&str> {
        match self {
            StageKind::Apply(name) | StageKind::WaitReady(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::QualityGate => f.write_str("quality-gate"),
            StageKind::Build => f.write_str("build"),
            StageKind::Publish => f.write_str("publish"),
            StageKind::Apply(name) => write!(f, "apply({name})"),
            StageKind::WaitReady(name) => write!(f, "wait-ready({name})"),
            StageKind::Probe => f.write_str("probe"),
            StageKind::Rollback => f.write_str("rollback"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
    Cancelled,
}

impl StageStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::TimedOut => "timed out",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

/// Category of a rollout-ending failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    TransientCollaborator,
    PermanentCollaborator,
    Timeout,
    Rollback,
    Cancelled,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation error",
            FailureKind::TransientCollaborator => "transient collaborator error",
            FailureKind::PermanentCollaborator => "permanent collaborator error",
            FailureKind::Timeout => "timeout",
            FailureKind::Rollback => "rollback error",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one executed stage. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageKind,
    pub status: StageStatus,
    pub detail: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    /// Collaborator calls made, retries included.
    pub attempts: u32,
    /// Resource the result concerns. For a failed rollback, the resource
    /// that could not be restored.
    pub resource: Option<ResourceName>,
    /// Artifact produced by build or publish.
    pub artifact: Option<ArtifactRef>,
    /// Failure category when the stage did not succeed.
    pub failure: Option<FailureKind>,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.status == StageStatus::Succeeded
    }

    pub fn duration_ms(&self) -> u64 {
        self.finished_at_ms.saturating_sub(self.started_at_ms)
    }
}

// ── Rollout record ─────────────────────────────────────────────────

/// Lifecycle state of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Building,
    Publishing,
    Applying,
    AwaitingHealth,
    RollingBack,
    Succeeded,
    Failed,
    RolledBack,
    RollbackFailed,
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutState::Succeeded
                | RolloutState::Failed
                | RolloutState::RolledBack
                | RolloutState::RollbackFailed
                | RolloutState::Cancelled
        )
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: RolloutState) -> bool {
        use RolloutState::*;
        match (*self, next) {
            (Pending, Building)
            | (Building, Publishing)
            | (Publishing, Applying)
            | (Applying, AwaitingHealth)
            | (AwaitingHealth, Succeeded) => true,
            (Applying | AwaitingHealth, RollingBack) => true,
            (RollingBack, RolledBack | RollbackFailed) => true,
            (Pending | Building | Publishing | Applying | AwaitingHealth, Failed | Cancelled) => {
                true
            }
            _ => false,
        }
    }

    /// Process exit status for a terminal state. Only `Succeeded` is zero.
    pub fn exit_code(&self) -> i32 {
        match self {
            RolloutState::Succeeded => 0,
            RolloutState::RolledBack => 2,
            RolloutState::Cancelled => 3,
            RolloutState::RollbackFailed => 4,
            _ => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RolloutState::Pending => "pending",
            RolloutState::Building => "building",
            RolloutState::Publishing => "publishing",
            RolloutState::Applying => "applying",
            RolloutState::AwaitingHealth => "awaiting-health",
            RolloutState::RollingBack => "rolling-back",
            RolloutState::Succeeded => "succeeded",
            RolloutState::Failed => "failed",
            RolloutState::RolledBack => "rolled-back",
            RolloutState::RollbackFailed => "rollback-failed",
            RolloutState::Cancelled => "cancelled",
        }
    }
}

/// Why a rollout ended somewhere other than `Succeeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationReason {
    pub kind: FailureKind,
    pub message: String,
}

impl TerminationReason {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.message)
    }
}

/// The most recent fully-succeeded resource set for an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownGoodSet {
    pub environment: String,
    pub resources: Vec<ResourceDescriptor>,
    pub artifact: Option<ArtifactRef>,
    pub rollout_id: String,
    pub recorded_at_ms: u64,
}

/// Aggregate state of one rollout attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub id: String,
    pub spec: DeploymentSpec,
    pub state: RolloutState,
    pub stages: Vec<StageResult>,
    /// Resources successfully applied, in apply order.
    pub applied: Vec<ResourceName>,
    pub artifact: Option<ArtifactRef>,
    /// Known-good descriptors re-applied during rollback.
    pub rollback_target: Option<Vec<ResourceDescriptor>>,
    pub reason: Option<TerminationReason>,
    pub started_at_ms: u64,
    pub finished_at_ms: Option<u64>,
}

impl RolloutRecord {
    pub fn environment(&self) -> &str {
        &self.spec.target.environment
    }

    /// Results recorded for a given stage kind.
    pub fn stages_of<'a>(
        &'a self,
        kind: &StageKind,
    ) -> impl Iterator<Item = &'a StageResult> + use<'a> {
        let kind = kind.clone();
        self.stages.iter().filter(move |s| s.stage == kind)
    }

    /// The resource set to remember as known-good, if this rollout succeeded.
    pub fn known_good(&self) -> Option<KnownGoodSet> {
        if self.state != RolloutState::Succeeded {
            return None;
        }
        Some(KnownGoodSet {
            environment: self.spec.target.environment.clone(),
            resources: self.spec.resources.clone(),
            artifact: self.artifact.clone(),
            rollout_id: self.id.clone(),
            recorded_at_ms: self.finished_at_ms.unwrap_or(self.started_at_ms),
        })
    }

    /// One-line operator summary.
    pub fn summary(&self) -> String {
        match &self.reason {
            Some(reason) => format!(
                "rollout {} to {} {}: {}",
                self.id,
                self.environment(),
                self.state.label(),
                reason
            ),
            None => format!(
                "rollout {} to {} {}",
                self.id,
                self.environment(),
                self.state.label()
            ),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl From<GraphError> for TerminationReason {
    fn from(err: GraphError) -> Self {
        TerminationReason::new(FailureKind::Validation, err.to_string())
    }
}

impl From<ValidationError> for TerminationReason {
    fn from(err: ValidationError) -> Self {
        TerminationReason::new(FailureKind::Validation, err.to_string())
    }
}
