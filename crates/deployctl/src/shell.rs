//! Shell-out collaborators.
//!
//! Each adapter runs a configured argv with `{placeholder}` substitution.
//! Nothing goes through a shell, so arguments are never re-split or
//! expanded. Children are killed if the stage deadline drops their future.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use deploy_core::{ArtifactRef, BuildContext, CollaboratorError, DeployTarget, ResourceDescriptor};
use deploy_rollout::{ApplyOutcome, ArtifactBuilder, QualityChecker, ResourceApplier};

use crate::digest::context_tag;

/// Stderr beyond this many bytes is cut from error messages.
const MAX_ERROR_OUTPUT: usize = 2048;

/// Replace every `{key}` in every argument. Substituted values are never
/// expanded again.
pub fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template.iter().map(|arg| expand(arg, vars)).collect()
}

fn expand(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let found = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, value)| (*value, close))
        });
        match found {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Output of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// The tail of stderr (or stdout when stderr is empty), trimmed.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.len() <= MAX_ERROR_OUTPUT {
            return text.to_string();
        }
        let mut start = text.len() - MAX_ERROR_OUTPUT;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        format!("…{}", &text[start..])
    }
}

/// Run `argv` in `cwd` and capture its output. Spawn failures (missing
/// binary, bad working directory) are permanent.
pub async fn run_command(argv: &[String], cwd: &Path) -> Result<CommandOutput, CollaboratorError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CollaboratorError::permanent("empty command"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(command = ?argv, cwd = %cwd.display(), "running command");

    let output = cmd.output().await.map_err(|e| {
        CollaboratorError::permanent(format!("failed to run `{program}`: {e}"))
    })?;

    Ok(CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ── Builder ─────────────────────────────────────────────────────

/// Builds and pushes container images with configured commands.
///
/// The artifact is `{image}:sha-<digest>` of the build context, so an
/// unchanged context yields the same reference on every run.
#[derive(Debug, Clone)]
pub struct ShellBuilder {
    base_dir: PathBuf,
    build: Option<Vec<String>>,
    publish: Option<Vec<String>>,
}

impl ShellBuilder {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        build: Option<Vec<String>>,
        publish: Option<Vec<String>>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            build,
            publish,
        }
    }

    fn context_dir(&self, context: &BuildContext) -> PathBuf {
        self.base_dir.join(&context.path)
    }
}

#[async_trait]
impl ArtifactBuilder for ShellBuilder {
    async fn build(
        &self,
        target: &DeployTarget,
        context: &BuildContext,
    ) -> Result<ArtifactRef, CollaboratorError> {
        let dir = self.context_dir(context);
        let digest_dir = dir.clone();
        let tag = tokio::task::spawn_blocking(move || context_tag(&digest_dir))
            .await
            .map_err(|e| CollaboratorError::permanent(format!("digest task failed: {e}")))?
            .map_err(|e| {
                CollaboratorError::permanent(format!(
                    "cannot read build context {}: {e}",
                    dir.display()
                ))
            })?;
        let artifact = ArtifactRef(format!("{}:{tag}", context.image));

        let Some(template) = &self.build else {
            debug!(%artifact, "no build command; using context digest only");
            return Ok(artifact);
        };
        let dir_str = dir.to_string_lossy();
        let argv = substitute(
            template,
            &[
                ("artifact", artifact.as_str()),
                ("context", &*dir_str),
                ("namespace", target.namespace.as_str()),
                ("environment", target.environment.as_str()),
            ],
        );
        let output = run_command(&argv, &self.base_dir).await?;
        if !output.success {
            return Err(CollaboratorError::permanent(format!(
                "build of {artifact} failed: {}",
                output.diagnostics()
            )));
        }
        Ok(artifact)
    }

    async fn publish(
        &self,
        target: &DeployTarget,
        artifact: &ArtifactRef,
    ) -> Result<ArtifactRef, CollaboratorError> {
        let Some(template) = &self.publish else {
            return Ok(artifact.clone());
        };
        let argv = substitute(
            template,
            &[
                ("artifact", artifact.as_str()),
                ("namespace", target.namespace.as_str()),
                ("environment", target.environment.as_str()),
            ],
        );
        let output = run_command(&argv, &self.base_dir).await?;
        if !output.success {
            return Err(CollaboratorError::transient(format!(
                "publish of {artifact} failed: {}",
                output.diagnostics()
            )));
        }
        Ok(artifact.clone())
    }
}

// ── Applier ─────────────────────────────────────────────────────

/// Applies manifests with a configured command (typically `kubectl apply`).
#[derive(Debug, Clone)]
pub struct ShellApplier {
    base_dir: PathBuf,
    deployment: String,
    command: Vec<String>,
    ready: Option<Vec<String>>,
}

impl ShellApplier {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        deployment: impl Into<String>,
        command: Vec<String>,
        ready: Option<Vec<String>>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            deployment: deployment.into(),
            command,
            ready,
        }
    }

    fn argv(
        &self,
        template: &[String],
        target: &DeployTarget,
        resource: &ResourceDescriptor,
        artifact: Option<&ArtifactRef>,
    ) -> Vec<String> {
        let manifest = self.base_dir.join(&resource.manifest);
        let manifest = manifest.to_string_lossy();
        substitute(
            template,
            &[
                ("manifest", &*manifest),
                ("namespace", target.namespace.as_str()),
                ("environment", target.environment.as_str()),
                ("name", resource.name.as_str()),
                ("deployment", self.deployment.as_str()),
                ("artifact", artifact.map(ArtifactRef::as_str).unwrap_or("")),
            ],
        )
    }
}

/// Read the apply outcome from `kubectl apply`-style output.
pub fn parse_apply_outcome(stdout: &str) -> ApplyOutcome {
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
    if !lines.is_empty() && lines.iter().all(|l| l.trim_end().ends_with("unchanged")) {
        ApplyOutcome::Unchanged
    } else if !lines.is_empty() && lines.iter().all(|l| l.trim_end().ends_with("created")) {
        ApplyOutcome::Created
    } else {
        ApplyOutcome::Configured
    }
}

#[async_trait]
impl ResourceApplier for ShellApplier {
    async fn apply(
        &self,
        target: &DeployTarget,
        resource: &ResourceDescriptor,
        artifact: Option<&ArtifactRef>,
    ) -> Result<ApplyOutcome, CollaboratorError> {
        let argv = self.argv(&self.command, target, resource, artifact);
        let output = run_command(&argv, &self.base_dir).await?;
        if !output.success {
            return Err(CollaboratorError::transient(format!(
                "apply of {} failed: {}",
                resource.name,
                output.diagnostics()
            )));
        }
        Ok(parse_apply_outcome(&output.stdout))
    }

    async fn ready(
        &self,
        target: &DeployTarget,
        resource: &ResourceDescriptor,
    ) -> Result<bool, CollaboratorError> {
        let Some(template) = &self.ready else {
            return Ok(true);
        };
        let argv = self.argv(template, target, resource, None);
        let output = run_command(&argv, &self.base_dir).await?;
        if !output.success {
            debug!(resource = %resource.name, output = %output.diagnostics(), "not ready");
        }
        Ok(output.success)
    }
}

// ── Quality ─────────────────────────────────────────────────────

/// Runs test and lint commands in the build context, in order.
#[derive(Debug, Clone)]
pub struct ShellQuality {
    base_dir: PathBuf,
    commands: Vec<Vec<String>>,
}

impl ShellQuality {
    pub fn new(base_dir: impl Into<PathBuf>, commands: Vec<Vec<String>>) -> Self {
        Self {
            base_dir: base_dir.into(),
            commands,
        }
    }
}

#[async_trait]
impl QualityChecker for ShellQuality {
    async fn check(
        &self,
        target: &DeployTarget,
        context: &BuildContext,
    ) -> Result<(), CollaboratorError> {
        let dir = self.base_dir.join(&context.path);
        let dir_str = dir.to_string_lossy();
        for template in &self.commands {
            let argv = substitute(
                template,
                &[("context", &*dir_str), ("environment", target.environment.as_str())],
            );
            let output = run_command(&argv, &dir).await?;
            if !output.success {
                return Err(CollaboratorError::permanent(format!(
                    "`{}` failed: {}",
                    argv.join(" "),
                    output.diagnostics()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    fn target() -> DeployTarget {
        DeployTarget {
            environment: "staging".to_string(),
            namespace: "chatbot-staging".to_string(),
        }
    }

    #[test]
    fn substitutes_inside_arguments() {
        let argv = substitute(
            &args(&["kubectl", "rollout", "status", "deployment/{deployment}", "-n", "{namespace}"]),
            &[("deployment", "chatbot"), ("namespace", "chatbot-staging")],
        );
        assert_eq!(
            argv,
            ["kubectl", "rollout", "status", "deployment/chatbot", "-n", "chatbot-staging"]
        );
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let argv = substitute(
            &args(&["{manifest}", "{namespace}", "{{artifact}}"]),
            &[
                ("manifest", "k8s/{namespace}.yaml"),
                ("namespace", "chatbot-staging"),
                ("artifact", "chatbot:v2"),
            ],
        );
        assert_eq!(argv, ["k8s/{namespace}.yaml", "chatbot-staging", "{chatbot:v2}"]);
    }

    #[test]
    fn unknown_placeholders_are_left_alone() {
        let argv = substitute(&args(&["echo", "{other}"]), &[("artifact", "x")]);
        assert_eq!(argv, ["echo", "{other}"]);
    }

    #[test]
    fn parses_kubectl_apply_output() {
        assert_eq!(
            parse_apply_outcome("configmap/chatbot-config unchanged\n"),
            ApplyOutcome::Unchanged
        );
        assert_eq!(
            parse_apply_outcome("namespace/chatbot created\n"),
            ApplyOutcome::Created
        );
        assert_eq!(
            parse_apply_outcome("deployment.apps/chatbot configured\n"),
            ApplyOutcome::Configured
        );
        assert_eq!(
            parse_apply_outcome("service/a unchanged\nservice/b configured\n"),
            ApplyOutcome::Configured
        );
        assert_eq!(parse_apply_outcome(""), ApplyOutcome::Configured);
    }

    #[test]
    fn diagnostics_prefers_stderr_and_truncates() {
        let out = CommandOutput {
            success: false,
            stdout: "ignored".to_string(),
            stderr: "x".repeat(MAX_ERROR_OUTPUT + 10),
        };
        let text = out.diagnostics();
        assert!(text.starts_with('…'));
        assert_eq!(text.chars().count(), MAX_ERROR_OUTPUT + 1);
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let err = run_command(&args(&["deployctl-no-such-binary"]), Path::new("."))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn applier_reports_outcome_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let resource = ResourceDescriptor::new("config", "k8s/configmap.yaml");

        let ok = ShellApplier::new(
            dir.path(),
            "chatbot",
            args(&["echo", "configmap/{name} unchanged"]),
            None,
        );
        assert_eq!(
            ok.apply(&target(), &resource, None).await,
            Ok(ApplyOutcome::Unchanged)
        );
        assert_eq!(ok.ready(&target(), &resource).await, Ok(true));

        let failing = ShellApplier::new(dir.path(), "chatbot", args(&["false"]), Some(args(&["false"])));
        let err = failing.apply(&target(), &resource, None).await.unwrap_err();
        assert!(err.retryable);
        assert_eq!(failing.ready(&target(), &resource).await, Ok(false));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn builder_tags_with_context_digest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM python:3.12\n").unwrap();
        let context = BuildContext {
            path: ".".to_string(),
            image: "registry.local/chatbot".to_string(),
        };

        let builder = ShellBuilder::new(dir.path(), Some(args(&["true"])), Some(args(&["false"])));
        let artifact = builder.build(&target(), &context).await.unwrap();
        assert!(artifact.as_str().starts_with("registry.local/chatbot:sha-"));

        let err = builder.publish(&target(), &artifact).await.unwrap_err();
        assert!(err.retryable);

        let broken = ShellBuilder::new(dir.path(), Some(args(&["false"])), None);
        assert!(!broken.build(&target(), &context).await.unwrap_err().retryable);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn quality_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let context = BuildContext {
            path: ".".to_string(),
            image: "chatbot".to_string(),
        };
        let quality = ShellQuality::new(
            dir.path(),
            vec![args(&["true"]), args(&["false"]), args(&["deployctl-no-such-binary"])],
        );
        let err = quality.check(&target(), &context).await.unwrap_err();
        assert!(err.message.contains("`false` failed"), "{err}");
    }
}
