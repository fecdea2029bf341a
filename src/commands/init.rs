use std::fs;
use std::path::Path;

use anyhow::Context;
use clap::Args;

use super::RepoArgs;
use crate::config::{self, Config};
use crate::github::GitHubClient;

#[derive(Debug, Args)]
pub struct InitArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
    /// Overwrite an existing config file
    #[arg(long)]
    pub force: bool,
    /// Only write the config file; do not touch GitHub labels
    #[arg(long)]
    pub no_labels: bool,
}

impl InitArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.repo.resolve()?;

        let config_path = self
            .repo
            .config
            .clone()
            .unwrap_or_else(|| ctx.root.join(config::CONFIG_FILE));
        if write_config(&config_path, self.force)? {
            println!("Generated {}", config_path.display());
        } else {
            println!("{} already exists (use --force to overwrite)", config_path.display());
        }

        if self.no_labels {
            return Ok(());
        }
        // Labels are a convenience here; `start` creates them too.
        match ctx.github().and_then(|client| client.ensure_labels_exist()) {
            Ok(created) if created.is_empty() => println!("Status labels already present"),
            Ok(created) => println!("Created labels: {}", created.join(", ")),
            Err(e) => tracing::warn!(error = %format!("{e:#}"), "skipped label setup"),
        }
        Ok(())
    }
}

/// Write a commented default config; returns false when one exists and `force` is unset.
fn write_config(path: &Path, force: bool) -> anyhow::Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    let toml_str = Config::default().to_toml()?;
    fs::write(path, toml_str).with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}
