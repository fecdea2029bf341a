//! Repository identity, derived from the `origin` remote.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;

use crate::error::ExitError;
use crate::subprocess::Tool;

/// `owner/name` of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn re_remote() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^(?:https?://|ssh://)?(?:[^@/]+@)?[^:/]+(?::\d+)?[:/]([^/]+)/([^/]+?)(?:\.git)?/?$")
            .unwrap()
    })
}

impl RepoRef {
    /// Parse `git@github.com:owner/repo.git`, `https://github.com/owner/repo`
    /// and `ssh://git@host/owner/repo.git` style remotes.
    pub fn parse_remote_url(url: &str) -> Option<Self> {
        let caps = re_remote().captures(url.trim())?;
        let owner = caps.get(1)?.as_str();
        let name = caps.get(2)?.as_str();
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Read the `origin` remote of the repository at `repo_root`.
    pub fn detect(repo_root: &Path) -> anyhow::Result<Self> {
        let output = Tool::new("git")
            .args(&["remote", "get-url", "origin"])
            .current_dir(repo_root)
            .run()?;
        if !output.success() {
            return Err(ExitError::Preflight(format!(
                "no `origin` remote in {}",
                repo_root.display()
            ))
            .into());
        }
        let url = output.stdout.trim();
        Self::parse_remote_url(url).ok_or_else(|| {
            ExitError::Preflight(format!("cannot parse GitHub repository from remote {url:?}")).into()
        })
    }

    /// Identifier safe for file names: `owner-name`.
    pub fn slug(&self) -> String {
        format!("{}-{}", self.owner, self.name)
    }
}

/// Top-level directory of the git repository containing `dir`.
pub fn repo_root(dir: &Path) -> anyhow::Result<PathBuf> {
    let output = Tool::new("git")
        .args(&["rev-parse", "--show-toplevel"])
        .current_dir(dir)
        .run()
        .context("locating git repository")?;
    if !output.success() {
        return Err(ExitError::Preflight(format!(
            "{} is not inside a git repository",
            dir.display()
        ))
        .into());
    }
    Ok(PathBuf::from(output.stdout.trim()))
}
