//! Health gate — polls a prober until healthy, deadline, or cancellation.

use std::sync::Arc;

use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, info, warn};

use deploy_core::{DeployTarget, HealthCheckSpec};

use crate::cancel::CancelSignal;
use crate::prober::{HealthProber, ProbeStatus};

/// How the gate ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    DeadlineExceeded,
    Cancelled,
    /// The prober reported a non-retryable error.
    ProbeFailed(String),
}

/// Outcome plus what it took to get there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub outcome: HealthOutcome,
    /// Probe calls issued, including one abandoned by cancellation.
    pub probes: u32,
    /// Last non-healthy observation, for operator messages.
    pub last_observation: Option<String>,
}

impl GateReport {
    /// One-line description for the stage result.
    pub fn describe(&self, check: &HealthCheckSpec) -> String {
        let last = self
            .last_observation
            .as_deref()
            .map(|o| format!(" (last: {o})"))
            .unwrap_or_default();
        match &self.outcome {
            HealthOutcome::Healthy => format!(
                "{} healthy after {} probe(s)",
                check.endpoint, self.probes
            ),
            HealthOutcome::DeadlineExceeded => format!(
                "{} not healthy within {:?} after {} probe(s){last}",
                check.endpoint, check.deadline, self.probes
            ),
            HealthOutcome::Cancelled => format!(
                "health gate for {} cancelled after {} probe(s)",
                check.endpoint, self.probes
            ),
            HealthOutcome::ProbeFailed(detail) => {
                format!("health probe for {} failed: {detail}", check.endpoint)
            }
        }
    }
}

/// Polls a [`HealthProber`] on the check's schedule.
#[derive(Clone)]
pub struct HealthGate {
    prober: Arc<dyn HealthProber>,
}

impl HealthGate {
    pub fn new(prober: Arc<dyn HealthProber>) -> Self {
        Self { prober }
    }

    /// Probe until the first healthy answer, the check deadline, or
    /// cancellation. A probe is issued immediately, then once per
    /// `poll_interval`.
    pub async fn await_healthy(
        &self,
        target: &DeployTarget,
        check: &HealthCheckSpec,
        mut cancel: CancelSignal,
    ) -> GateReport {
        let deadline = Instant::now() + check.deadline;
        let mut probes = 0u32;
        let mut last_observation = None;

        let report = |outcome: HealthOutcome, probes: u32, last: Option<String>| GateReport {
            outcome,
            probes,
            last_observation: last,
        };

        debug!(environment = %target.environment, endpoint = %check.endpoint, "health gate starting");

        loop {
            if cancel.is_cancelled() {
                return report(HealthOutcome::Cancelled, probes, last_observation);
            }
            if Instant::now() >= deadline {
                return report(HealthOutcome::DeadlineExceeded, probes, last_observation);
            }

            probes += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(environment = %target.environment, probes, "health gate cancelled mid-probe");
                    return report(HealthOutcome::Cancelled, probes, last_observation);
                }
                _ = sleep_until(deadline) => {
                    return report(HealthOutcome::DeadlineExceeded, probes, last_observation);
                }
                r = timeout(check.probe_timeout, self.prober.probe(target, check)) => r,
            };

            match result {
                Ok(Ok(ProbeStatus::Healthy)) => {
                    info!(environment = %target.environment, endpoint = %check.endpoint, probes, "health gate passed");
                    return report(HealthOutcome::Healthy, probes, last_observation);
                }
                Ok(Ok(ProbeStatus::Unhealthy)) => {
                    debug!(environment = %target.environment, probes, "endpoint not healthy yet");
                    last_observation = Some("unhealthy response".to_string());
                }
                Ok(Err(e)) if e.retryable => {
                    debug!(environment = %target.environment, error = %e, probes, "probe error, will retry");
                    last_observation = Some(e.message);
                }
                Ok(Err(e)) => {
                    warn!(environment = %target.environment, error = %e, "probe failed permanently");
                    return report(HealthOutcome::ProbeFailed(e.message), probes, last_observation);
                }
                Err(_) => {
                    debug!(environment = %target.environment, probes, "probe timed out");
                    last_observation = Some(format!("probe timed out after {:?}", check.probe_timeout));
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(environment = %target.environment, probes, "health gate cancelled");
                    return report(HealthOutcome::Cancelled, probes, last_observation);
                }
                _ = sleep_until(deadline) => {
                    warn!(environment = %target.environment, endpoint = %check.endpoint, probes, "health gate deadline exceeded");
                    return report(HealthOutcome::DeadlineExceeded, probes, last_observation);
                }
                _ = sleep(check.poll_interval) => {}
            }
        }
    }
}
