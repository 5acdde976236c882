use std::path::Path;

use anyhow::bail;

use deploy_core::DeployConfig;

/// Write a scaffold deploy.toml for a five-resource kubectl stack.
pub fn init(path: &Path, name: &str, environment: &str, image: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    let config = DeployConfig::scaffold(name, environment, image);
    std::fs::write(path, config.to_toml_string()?)?;
    println!("✓ Generated {}", path.display());
    Ok(())
}
