//! Reclaims the windows and worktrees of finished issues.
//!
//! Issues are discovered from resource names alone (`{n}-{phase}` windows,
//! `issue-{n}` worktrees); nothing is tracked on the side.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::github::{GitHubClient, ItemState};
use crate::tmux::{self, TerminalManager};
use crate::worktree::{self, WorktreeManager};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub windows_killed: usize,
    pub worktrees_removed: usize,
    /// Worktrees kept because they have uncommitted changes.
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

impl CleanupReport {
    fn absorb(&mut self, other: Self) {
        self.windows_killed += other.windows_killed;
        self.worktrees_removed += other.worktrees_removed;
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct CleanupManager {
    session: String,
    worktree_base: PathBuf,
    terminal: Arc<dyn TerminalManager>,
    worktrees: Arc<dyn WorktreeManager>,
}

impl CleanupManager {
    pub fn new(
        session: &str,
        worktree_base: &Path,
        terminal: Arc<dyn TerminalManager>,
        worktrees: Arc<dyn WorktreeManager>,
    ) -> Self {
        Self {
            session: session.to_string(),
            worktree_base: worktree_base.to_path_buf(),
            terminal,
            worktrees,
        }
    }

    /// Issue numbers that still own a window or a worktree.
    pub fn discover(&self) -> anyhow::Result<BTreeSet<u64>> {
        let mut issues = BTreeSet::new();
        if self.terminal.session_exists(&self.session)? {
            issues.extend(
                self.terminal
                    .list_windows(&self.session)?
                    .iter()
                    .filter_map(|w| tmux::parse_window_name(w))
                    .map(|(n, _)| n),
            );
        }
        issues.extend(
            self.worktrees
                .list_worktrees()?
                .iter()
                .filter(|p| p.parent() == Some(self.worktree_base.as_path()))
                .filter_map(|p| p.file_name()?.to_str().and_then(worktree::parse_worktree_dir)),
        );
        Ok(issues)
    }

    /// Kill the issue's windows and remove its worktree. A dirty worktree is
    /// kept unless `force`.
    pub fn cleanup_issue(&self, number: u64, force: bool) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.terminal.windows_for_issue(&self.session, number) {
            Ok(windows) => {
                for window in windows {
                    match self.terminal.kill_window(&self.session, &window) {
                        Ok(()) => report.windows_killed += 1,
                        Err(e) => report.errors.push(format!("window {window}: {e:#}")),
                    }
                }
            }
            Err(e) => report.errors.push(format!("#{number} windows: {e:#}")),
        }

        let path = worktree::worktree_path(&self.worktree_base, number);
        let present = match self.worktrees.list_worktrees() {
            Ok(list) => list.contains(&path),
            Err(e) => {
                report.errors.push(format!("#{number} worktrees: {e:#}"));
                return report;
            }
        };
        if !present {
            return report;
        }
        if !force {
            match self.worktrees.has_uncommitted_changes(&path) {
                Ok(true) => {
                    tracing::warn!(issue = number, path = %path.display(), "keeping worktree with uncommitted changes");
                    report.skipped.push(format!("{} (uncommitted changes)", path.display()));
                    return report;
                }
                Ok(false) => {}
                Err(e) => {
                    report.errors.push(format!("{}: {e:#}", path.display()));
                    return report;
                }
            }
        }
        match self.worktrees.remove_worktree(&path, force) {
            Ok(()) => report.worktrees_removed += 1,
            Err(e) => report.errors.push(format!("{}: {e:#}", path.display())),
        }
        tracing::info!(
            issue = number,
            windows = report.windows_killed,
            worktrees = report.worktrees_removed,
            "cleaned up"
        );
        report
    }

    /// Clean every discovered issue that GitHub reports as closed.
    pub fn cleanup_closed(&self, client: &dyn GitHubClient, force: bool) -> anyhow::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for number in self.discover()? {
            match client.get_issue(number) {
                Ok(issue) if issue.state == ItemState::Closed => {
                    report.absorb(self.cleanup_issue(number, force));
                }
                Ok(_) => tracing::debug!(issue = number, "still open, keeping"),
                Err(e) => report.errors.push(format!("#{number}: {e:#}")),
            }
        }
        Ok(report)
    }

    /// Clean every discovered issue, then kill the session.
    pub fn cleanup_all(&self, force: bool) -> anyhow::Result<CleanupReport> {
        let mut report = CleanupReport::default();
        for number in self.discover()? {
            report.absorb(self.cleanup_issue(number, force));
        }
        if let Err(e) = self.terminal.kill_session(&self.session) {
            report.errors.push(format!("session {}: {e:#}", self.session));
        }
        Ok(report)
    }
}
