pub mod history;
pub mod init;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Args;

use deploy_core::{DeployConfig, DeploymentSpec};

/// Flags that override values from deploy.toml.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Target environment (overrides [deployment].environment)
    #[arg(short, long)]
    pub environment: Option<String>,
    /// Target namespace (overrides [deployment].namespace)
    #[arg(short, long)]
    pub namespace: Option<String>,
    /// Fail instead of rolling back past the committal point
    #[arg(long)]
    pub no_rollback: bool,
    /// Retries per stage after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,
}

impl Overrides {
    fn apply(&self, config: &mut DeployConfig) {
        if let Some(environment) = &self.environment {
            config.deployment.environment = environment.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.deployment.namespace = Some(namespace.clone());
        }
        if self.no_rollback || self.max_retries.is_some() {
            let policy = config.policy.get_or_insert_with(Default::default);
            if self.no_rollback {
                policy.rollback = Some(false);
            }
            if let Some(retries) = self.max_retries {
                policy.max_retries = Some(retries);
            }
        }
    }
}

/// A parsed, overridden, and validated deploy.toml.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: DeployConfig,
    pub spec: DeploymentSpec,
    /// Directory relative paths in the config resolve against.
    pub base_dir: PathBuf,
}

pub fn load(path: &Path, overrides: &Overrides) -> anyhow::Result<Loaded> {
    let mut config = DeployConfig::from_file(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    overrides.apply(&mut config);
    let spec = config
        .into_spec()
        .with_context(|| format!("{} is not a valid deployment", path.display()))?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(Loaded {
        config,
        spec,
        base_dir,
    })
}
