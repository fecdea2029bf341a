pub mod cleanup;
pub mod init;
pub mod open;
pub mod schema;
pub mod start;
pub mod status;
pub mod stop;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;

use crate::config::Config;
use crate::daemon::Supervisor;
use crate::error::ExitError;
use crate::github::{RepoRef, RestClient, remote};
use crate::tmux::TmuxManager;
use crate::worktree::GitWorktreeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Text,
    Json,
}

impl OutputFormat {
    /// Explicit choice, else pretty on a terminal and text when piped.
    pub fn resolve(explicit: Option<Self>) -> Self {
        explicit.unwrap_or_else(|| {
            if std::io::stdout().is_terminal() {
                Self::Pretty
            } else {
                Self::Text
            }
        })
    }
}

/// Repository selection shared by every command.
#[derive(Debug, Clone, Default, Args)]
pub struct RepoArgs {
    /// Repository to operate on (default: the one containing the current directory)
    #[arg(long, value_name = "DIR")]
    pub repo: Option<PathBuf>,
    /// Config file (default: <repo>/.osoba.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// A resolved repository: root, config and (when available) its GitHub remote.
pub struct RepoContext {
    pub root: PathBuf,
    pub config: Config,
    pub remote: Option<RepoRef>,
}

impl RepoArgs {
    pub fn resolve(&self) -> anyhow::Result<RepoContext> {
        let start = match self.repo {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let root = remote::repo_root(&start)?;
        let config = Config::load_for_repo(&root, self.config.as_deref())?;
        let remote = match RepoRef::detect(&root) {
            Ok(remote) => Some(remote),
            Err(e) => {
                tracing::debug!(error = %format!("{e:#}"), "no usable origin remote");
                None
            }
        };
        Ok(RepoContext {
            root,
            config,
            remote,
        })
    }

    /// Arguments that reselect this repository in a child process.
    pub fn to_child_args(&self, root: &Path) -> Vec<std::ffi::OsString> {
        let mut args = vec!["--repo".into(), root.as_os_str().to_owned()];
        if let Some(ref config) = self.config {
            let config = std::path::absolute(config).unwrap_or_else(|_| config.clone());
            args.push("--config".into());
            args.push(config.into_os_string());
        }
        args
    }
}

impl RepoContext {
    /// Short repository name used for the tmux session.
    pub fn name(&self) -> String {
        self.remote.as_ref().map_or_else(
            || {
                self.root
                    .file_name()
                    .map_or_else(|| "repo".to_string(), |n| n.to_string_lossy().into_owned())
            },
            |r| r.name.clone(),
        )
    }

    pub fn session(&self) -> String {
        self.config.session_name(&self.name())
    }

    pub fn worktree_base(&self) -> PathBuf {
        self.config.worktree_base(&self.root)
    }

    pub fn supervisor(&self) -> anyhow::Result<Supervisor> {
        Supervisor::for_repo(&self.root, self.remote.as_ref())
    }

    pub fn require_remote(&self) -> anyhow::Result<&RepoRef> {
        self.remote.as_ref().ok_or_else(|| {
            ExitError::Preflight(format!(
                "{} has no GitHub `origin` remote",
                self.root.display()
            ))
            .into()
        })
    }

    pub fn github(&self) -> anyhow::Result<RestClient> {
        let remote = self.require_remote()?.clone();
        RestClient::from_config(&self.config, remote)
    }

    pub fn terminal(&self) -> Arc<TmuxManager> {
        Arc::new(TmuxManager::new())
    }

    pub fn worktrees(&self) -> Arc<GitWorktreeManager> {
        Arc::new(GitWorktreeManager::new(
            &self.root,
            &self.worktree_base(),
            &self.config.worktree.base_branch,
        ))
    }
}
