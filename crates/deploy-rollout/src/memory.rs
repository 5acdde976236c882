//! In-memory collaborators.
//!
//! Used for dry runs (nothing leaves the process) and as scriptable doubles
//! in tests: each one can be told to fail, stall, or report not-ready, and
//! records what it was asked to do.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use deploy_core::{
    ArtifactRef, BuildContext, CollaboratorError, DeployTarget, HealthCheckSpec,
    ResourceDescriptor, RolloutRecord, RolloutState,
};
use deploy_health::{HealthProber, ProbeStatus};

use crate::collaborators::{
    ApplyOutcome, ArtifactBuilder, NotificationSink, QualityChecker, ResourceApplier,
};

// ── Builder ─────────────────────────────────────────────────────

/// Tags `{image}:{tag}` without building anything.
#[derive(Debug)]
pub struct MemoryBuilder {
    tag: String,
    delay: Mutex<Duration>,
    build_failures: Mutex<VecDeque<CollaboratorError>>,
    publish_failures: Mutex<VecDeque<CollaboratorError>>,
    build_calls: AtomicU32,
    publish_calls: AtomicU32,
}

impl Default for MemoryBuilder {
    fn default() -> Self {
        Self::with_tag("dry-run")
    }
}

impl MemoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            delay: Mutex::new(Duration::ZERO),
            build_failures: Mutex::new(VecDeque::new()),
            publish_failures: Mutex::new(VecDeque::new()),
            build_calls: AtomicU32::new(0),
            publish_calls: AtomicU32::new(0),
        }
    }

    /// Fail the next `times` builds with `error`.
    pub fn fail_builds(&self, times: u32, error: CollaboratorError) {
        let mut queue = self.build_failures.lock().unwrap();
        queue.extend(std::iter::repeat_n(error, times as usize));
    }

    /// Fail the next `times` publishes with `error`.
    pub fn fail_publishes(&self, times: u32, error: CollaboratorError) {
        let mut queue = self.publish_failures.lock().unwrap();
        queue.extend(std::iter::repeat_n(error, times as usize));
    }

    /// Stall every build and publish call for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn build_calls(&self) -> u32 {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> u32 {
        self.publish_calls.load(Ordering::SeqCst)
    }

    async fn stall(&self) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ArtifactBuilder for MemoryBuilder {
    async fn build(
        &self,
        _target: &DeployTarget,
        context: &BuildContext,
    ) -> Result<ArtifactRef, CollaboratorError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if let Some(err) = self.build_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(ArtifactRef(format!("{}:{}", context.image, self.tag)))
    }

    async fn publish(
        &self,
        _target: &DeployTarget,
        artifact: &ArtifactRef,
    ) -> Result<ArtifactRef, CollaboratorError> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.stall().await;
        if let Some(err) = self.publish_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(artifact.clone())
    }
}

// ── Applier ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct LiveObject {
    manifest: String,
    artifact: Option<ArtifactRef>,
}

/// One call to [`MemoryApplier::apply`] that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub resource: String,
    pub artifact: Option<ArtifactRef>,
    pub outcome: ApplyOutcome,
}

/// Keeps "live" objects in a map, keyed by resource name.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    live: Mutex<HashMap<String, LiveObject>>,
    always_fail: Mutex<HashMap<String, CollaboratorError>>,
    fail_next: Mutex<HashMap<String, VecDeque<CollaboratorError>>>,
    not_ready: Mutex<HashMap<String, u32>>,
    log: Mutex<Vec<Application>>,
    calls: AtomicU32,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every apply of `resource` until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, resource: &str, error: CollaboratorError) {
        self.always_fail
            .lock()
            .unwrap()
            .insert(resource.to_string(), error);
    }

    /// Fail the next `times` applies of `resource`.
    pub fn fail_times(&self, resource: &str, times: u32, error: CollaboratorError) {
        self.fail_next
            .lock()
            .unwrap()
            .entry(resource.to_string())
            .or_default()
            .extend(std::iter::repeat_n(error, times as usize));
    }

    pub fn clear_failures(&self) {
        self.always_fail.lock().unwrap().clear();
        self.fail_next.lock().unwrap().clear();
    }

    /// Report `resource` as not ready for the next `checks` readiness queries.
    pub fn not_ready_for(&self, resource: &str, checks: u32) {
        self.not_ready
            .lock()
            .unwrap()
            .insert(resource.to_string(), checks);
    }

    /// Total apply calls, failed ones included.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Successful applications, oldest first.
    pub fn applications(&self) -> Vec<Application> {
        self.log.lock().unwrap().clone()
    }

    /// Names of successfully applied resources, in call order.
    pub fn applied(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.resource.clone())
            .collect()
    }

    pub fn outcomes(&self) -> Vec<ApplyOutcome> {
        self.log.lock().unwrap().iter().map(|a| a.outcome).collect()
    }

    /// Artifact the live object for `resource` currently references.
    pub fn live_artifact(&self, resource: &str) -> Option<ArtifactRef> {
        self.live
            .lock()
            .unwrap()
            .get(resource)
            .and_then(|o| o.artifact.clone())
    }

    pub fn is_live(&self, resource: &str) -> bool {
        self.live.lock().unwrap().contains_key(resource)
    }
}

#[async_trait]
impl ResourceApplier for MemoryApplier {
    async fn apply(
        &self,
        _target: &DeployTarget,
        resource: &ResourceDescriptor,
        artifact: Option<&ArtifactRef>,
    ) -> Result<ApplyOutcome, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.always_fail.lock().unwrap().get(&resource.name) {
            return Err(err.clone());
        }
        if let Some(err) = self
            .fail_next
            .lock()
            .unwrap()
            .get_mut(&resource.name)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let desired = LiveObject {
            manifest: resource.manifest.clone(),
            artifact: artifact.cloned(),
        };
        let outcome = {
            let mut live = self.live.lock().unwrap();
            match live.insert(resource.name.clone(), desired.clone()) {
                None => ApplyOutcome::Created,
                Some(previous) if previous == desired => ApplyOutcome::Unchanged,
                Some(_) => ApplyOutcome::Configured,
            }
        };

        self.log.lock().unwrap().push(Application {
            resource: resource.name.clone(),
            artifact: desired.artifact,
            outcome,
        });
        Ok(outcome)
    }

    async fn ready(
        &self,
        _target: &DeployTarget,
        resource: &ResourceDescriptor,
    ) -> Result<bool, CollaboratorError> {
        let mut pending = self.not_ready.lock().unwrap();
        match pending.get_mut(&resource.name) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

// ── Prober ──────────────────────────────────────────────────────

/// Replays scripted answers; the last one repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedProber {
    script: Mutex<VecDeque<Result<ProbeStatus, CollaboratorError>>>,
    last: Mutex<Result<ProbeStatus, CollaboratorError>>,
    calls: AtomicU32,
}

impl ScriptedProber {
    pub fn new(script: Vec<Result<ProbeStatus, CollaboratorError>>) -> Self {
        let last = script.last().cloned().unwrap_or(Ok(ProbeStatus::Healthy));
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always(status: ProbeStatus) -> Self {
        Self::new(vec![Ok(status)])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProber for ScriptedProber {
    async fn probe(
        &self,
        _target: &DeployTarget,
        _check: &HealthCheckSpec,
    ) -> Result<ProbeStatus, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => self.last.lock().unwrap().clone(),
        }
    }
}

// ── Quality ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryQuality {
    result: Result<(), CollaboratorError>,
    calls: AtomicU32,
}

impl MemoryQuality {
    pub fn passing() -> Self {
        Self {
            result: Ok(()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            result: Err(error),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityChecker for MemoryQuality {
    async fn check(
        &self,
        _target: &DeployTarget,
        _context: &BuildContext,
    ) -> Result<(), CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

// ── Sink ────────────────────────────────────────────────────────

/// Keeps every record snapshot it is handed.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<RolloutRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RolloutRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Distinct states in the order they were first observed.
    pub fn states(&self) -> Vec<RolloutState> {
        let mut states: Vec<RolloutState> = Vec::new();
        for record in self.records.lock().unwrap().iter() {
            if states.last() != Some(&record.state) {
                states.push(record.state);
            }
        }
        states
    }
}

impl NotificationSink for MemorySink {
    fn record(&self, record: &RolloutRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}
