//! deploy.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use crate::duration::{format_duration, parse_duration};
use crate::error::ValidationError;
use crate::types::{
    BuildContext, DeployTarget, DeploymentSpec, HealthCheckSpec, ResourceDescriptor,
    RolloutPolicy, SuccessCondition,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub deployment: DeploymentConfig,
    pub artifact: ArtifactConfig,
    pub apply: Option<ApplyConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    pub health: HealthConfig,
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,
    pub environment: String,
    /// Defaults to `{name}-{environment}`.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub image: String,
    /// Build context directory, relative to deploy.toml. Defaults to ".".
    pub context: Option<String>,
    /// Build command; `{artifact}` and `{context}` are substituted.
    pub build: Option<Vec<String>>,
    /// Publish command; `{artifact}` is substituted.
    pub publish: Option<Vec<String>>,
    /// Quality checks run before the build (tests, linters).
    pub quality: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyConfig {
    /// Apply command; `{manifest}`, `{namespace}`, `{name}`, `{deployment}`
    /// and `{artifact}` are substituted.
    pub command: Vec<String>,
    /// Readiness command; exit status 0 means ready.
    pub ready: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    pub manifest: String,
    pub depends_on: Option<Vec<String>>,
    pub wait_ready: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub endpoint: String,
    pub expect_status: Option<u16>,
    pub body_contains: Option<String>,
    pub interval: Option<String>,
    pub deadline: Option<String>,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub stage_timeout: Option<String>,
    pub max_retries: Option<u32>,
    pub backoff_base: Option<String>,
    pub backoff_cap: Option<String>,
    pub rollback: Option<bool>,
    pub strict_quality_gate: Option<bool>,
    pub ready_interval: Option<String>,
}

impl DeployConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DeployConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolve defaults and build a validated [`DeploymentSpec`].
    pub fn into_spec(&self) -> Result<DeploymentSpec, ValidationError> {
        let defaults = RolloutPolicy::default();
        let policy = self.policy.clone().unwrap_or_default();
        let health = &self.health;

        let namespace = self.deployment.namespace.clone().unwrap_or_else(|| {
            format!("{}-{}", self.deployment.name, self.deployment.environment)
        });

        let spec = DeploymentSpec {
            name: self.deployment.name.clone(),
            target: DeployTarget {
                environment: self.deployment.environment.clone(),
                namespace,
            },
            build: BuildContext {
                path: self
                    .artifact
                    .context
                    .clone()
                    .unwrap_or_else(|| ".".to_string()),
                image: self.artifact.image.clone(),
            },
            resources: self
                .resources
                .iter()
                .map(|r| ResourceDescriptor {
                    name: r.name.clone(),
                    depends_on: r
                        .depends_on
                        .iter()
                        .flatten()
                        .cloned()
                        .collect::<BTreeSet<_>>(),
                    manifest: r.manifest.clone(),
                    wait_ready: r.wait_ready.unwrap_or(false),
                })
                .collect(),
            health: HealthCheckSpec {
                endpoint: health.endpoint.clone(),
                expect: SuccessCondition {
                    status: health.expect_status,
                    body_contains: health.body_contains.clone(),
                },
                poll_interval: duration_field(
                    "health.interval",
                    health.interval.as_deref(),
                    Duration::from_secs(5),
                )?,
                deadline: duration_field(
                    "health.deadline",
                    health.deadline.as_deref(),
                    Duration::from_secs(120),
                )?,
                probe_timeout: duration_field(
                    "health.timeout",
                    health.timeout.as_deref(),
                    Duration::from_secs(2),
                )?,
            },
            policy: RolloutPolicy {
                stage_timeout: duration_field(
                    "policy.stage_timeout",
                    policy.stage_timeout.as_deref(),
                    defaults.stage_timeout,
                )?,
                max_retries: policy.max_retries.unwrap_or(defaults.max_retries),
                backoff_base: duration_field(
                    "policy.backoff_base",
                    policy.backoff_base.as_deref(),
                    defaults.backoff_base,
                )?,
                backoff_cap: duration_field(
                    "policy.backoff_cap",
                    policy.backoff_cap.as_deref(),
                    defaults.backoff_cap,
                )?,
                rollback_enabled: policy.rollback.unwrap_or(defaults.rollback_enabled),
                strict_quality_gate: policy
                    .strict_quality_gate
                    .unwrap_or(defaults.strict_quality_gate),
                ready_poll_interval: duration_field(
                    "policy.ready_interval",
                    policy.ready_interval.as_deref(),
                    defaults.ready_poll_interval,
                )?,
            },
        };

        spec.validate()?;
        Ok(spec)
    }

    /// Scaffold a deploy.toml for a namespace → config → workload →
    /// network-exposure → autoscaler stack applied with kubectl.
    pub fn scaffold(name: &str, environment: &str, image: &str) -> Self {
        let resource = |name: &str, deps: &[&str], wait_ready: bool| ResourceConfig {
            name: name.to_string(),
            manifest: format!("k8s/{name}.yaml"),
            depends_on: (!deps.is_empty())
                .then(|| deps.iter().map(|d| d.to_string()).collect()),
            wait_ready: wait_ready.then_some(true),
        };
        let args = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        let defaults = RolloutPolicy::default();

        DeployConfig {
            deployment: DeploymentConfig {
                name: name.to_string(),
                environment: environment.to_string(),
                namespace: Some(format!("{name}-{environment}")),
            },
            artifact: ArtifactConfig {
                image: image.to_string(),
                context: Some(".".to_string()),
                build: Some(args(&["docker", "build", "-t", "{artifact}", "{context}"])),
                publish: Some(args(&["docker", "push", "{artifact}"])),
                quality: None,
            },
            apply: Some(ApplyConfig {
                command: args(&["kubectl", "apply", "-n", "{namespace}", "-f", "{manifest}"]),
                ready: Some(args(&[
                    "kubectl",
                    "rollout",
                    "status",
                    "deployment/{deployment}",
                    "-n",
                    "{namespace}",
                    "--timeout=5s",
                ])),
            }),
            resources: vec![
                resource("namespace", &[], false),
                resource("config", &["namespace"], false),
                resource("workload", &["config"], true),
                resource("network-exposure", &["workload"], false),
                resource("autoscaler", &["workload"], false),
            ],
            health: HealthConfig {
                endpoint: "http://127.0.0.1:8000/health".to_string(),
                expect_status: Some(200),
                body_contains: Some("healthy".to_string()),
                interval: Some("5s".to_string()),
                deadline: Some("2m".to_string()),
                timeout: Some("2s".to_string()),
            },
            policy: Some(PolicyConfig {
                stage_timeout: Some(format_duration(defaults.stage_timeout)),
                max_retries: Some(defaults.max_retries),
                backoff_base: Some(format_duration(defaults.backoff_base)),
                backoff_cap: Some(format_duration(defaults.backoff_cap)),
                rollback: Some(true),
                strict_quality_gate: Some(true),
                ready_interval: Some(format_duration(defaults.ready_poll_interval)),
            }),
        }
    }
}

fn duration_field(
    field: &'static str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ValidationError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw).ok_or_else(|| ValidationError::InvalidValue {
            field,
            reason: format!("`{raw}` is not a duration"),
        }),
    }
}
