//! Worktree provider: one git worktree per issue on branch `osoba/#N`.

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::subprocess::Tool;

/// Branch an issue's work lives on.
pub fn branch_name(issue: u64) -> String {
    format!("osoba/#{issue}")
}

/// Checkout directory for an issue under `base`.
pub fn worktree_path(base: &Path, issue: u64) -> PathBuf {
    base.join(format!("issue-{issue}"))
}

/// Issue number of an `issue-N` directory name.
pub fn parse_worktree_dir(name: &str) -> Option<u64> {
    name.strip_prefix("issue-")?.parse().ok()
}

pub trait WorktreeManager: Send + Sync {
    /// Create the checkout unless it already exists. Returns true when created.
    fn ensure_worktree(&self, path: &Path, branch: &str) -> anyhow::Result<bool>;

    fn has_uncommitted_changes(&self, path: &Path) -> anyhow::Result<bool>;

    fn remove_worktree(&self, path: &Path, force: bool) -> anyhow::Result<()>;

    /// Checkouts under the managed base directory.
    fn list_worktrees(&self) -> anyhow::Result<Vec<PathBuf>>;
}

/// [`WorktreeManager`] backed by `git worktree`.
#[derive(Debug, Clone)]
pub struct GitWorktreeManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
    base_branch: String,
}

impl GitWorktreeManager {
    pub fn new(repo_root: &Path, base_dir: &Path, base_branch: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            base_dir: base_dir.to_path_buf(),
            base_branch: base_branch.to_string(),
        }
    }

    fn git(&self) -> Tool {
        Tool::new("git").current_dir(&self.repo_root)
    }

    fn ref_exists(&self, reference: &str) -> bool {
        self.git()
            .args(&["rev-parse", "--verify", "--quiet", reference])
            .run()
            .is_ok_and(|o| o.success())
    }

    /// Start point for new branches: `origin/<base>` when known, else `<base>`.
    fn start_point(&self) -> String {
        let _ = self
            .git()
            .args(&["fetch", "--quiet", "origin", &self.base_branch])
            .run();
        let remote = format!("origin/{}", self.base_branch);
        if self.ref_exists(&remote) {
            remote
        } else {
            self.base_branch.clone()
        }
    }
}

impl WorktreeManager for GitWorktreeManager {
    fn ensure_worktree(&self, path: &Path, branch: &str) -> anyhow::Result<bool> {
        if path.join(".git").exists() {
            tracing::debug!(path = %path.display(), "reusing worktree");
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let path_str = path.to_string_lossy();
        if self.ref_exists(&format!("refs/heads/{branch}")) {
            self.git()
                .args(&["worktree", "add", &path_str, branch])
                .run_ok()
                .with_context(|| format!("adding worktree for existing branch {branch}"))?;
        } else {
            let start = self.start_point();
            self.git()
                .args(&["worktree", "add", "-b", branch, &path_str, &start])
                .run_ok()
                .with_context(|| format!("adding worktree on new branch {branch} from {start}"))?;
        }
        tracing::info!(path = %path.display(), branch, "created worktree");
        Ok(true)
    }

    fn has_uncommitted_changes(&self, path: &Path) -> anyhow::Result<bool> {
        let output = Tool::new("git")
            .args(&["status", "--porcelain"])
            .current_dir(path)
            .run_ok()
            .with_context(|| format!("checking {} for uncommitted changes", path.display()))?;
        Ok(!output.stdout.trim().is_empty())
    }

    fn remove_worktree(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.git()
            .args(&args)
            .run_ok()
            .with_context(|| format!("removing worktree {}", path.display()))?;
        let _ = self.git().args(&["worktree", "prune"]).run();
        Ok(())
    }

    fn list_worktrees(&self) -> anyhow::Result<Vec<PathBuf>> {
        let output = self
            .git()
            .args(&["worktree", "list", "--porcelain"])
            .run_ok()
            .context("listing worktrees")?;
        Ok(parse_worktree_list(&output.stdout)
            .into_iter()
            .filter(|p| p.starts_with(&self.base_dir))
            .collect())
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<PathBuf> {
    porcelain
        .lines()
        .filter_map(|l| l.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_is_a_pure_function_of_issue() {
        assert_eq!(branch_name(83), "osoba/#83");
        assert_eq!(
            worktree_path(Path::new("/repo/.git/osoba/worktrees"), 83),
            PathBuf::from("/repo/.git/osoba/worktrees/issue-83")
        );
    }

    #[test]
    fn parses_worktree_dir_names() {
        assert_eq!(parse_worktree_dir("issue-83"), Some(83));
        assert_eq!(parse_worktree_dir("issue-"), None);
        assert_eq!(parse_worktree_dir("feature-x"), None);
    }

    #[test]
    fn parses_porcelain_listing() {
        let porcelain = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\nworktree /repo/.git/osoba/worktrees/issue-83\nHEAD def\nbranch refs/heads/osoba/#83\n";
        assert_eq!(
            parse_worktree_list(porcelain),
            vec![
                PathBuf::from("/repo"),
                PathBuf::from("/repo/.git/osoba/worktrees/issue-83")
            ]
        );
    }

    #[test]
    fn existing_checkout_is_reused_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let path = worktree_path(dir.path(), 5);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(".git"), "gitdir: elsewhere").unwrap();
        let manager = GitWorktreeManager::new(dir.path(), dir.path(), "main");
        assert!(!manager.ensure_worktree(&path, &branch_name(5)).unwrap());
    }
}
