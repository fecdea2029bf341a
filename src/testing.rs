//! In-memory providers for unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::config::MergeMethod;
use crate::dispatch::{Dispatched, Dispatcher, WorkEnvironment};
use crate::github::{
    CheckState, GitHubClient, Issue, ItemState, Mergeable, PrStatus, PullRequest, RateLimit,
};
use crate::labels::{Phase, PhaseLabel};
use crate::tmux::{PaneInfo, TerminalManager};
use crate::worktree::WorktreeManager;

pub fn issue(number: u64, labels: &[&str]) -> Issue {
    Issue {
        number,
        title: format!("Issue {number}"),
        body: String::new(),
        labels: labels.iter().map(ToString::to_string).collect(),
        state: ItemState::Open,
    }
}

pub fn pull_request(number: u64, labels: &[&str], state: ItemState, draft: bool) -> PullRequest {
    PullRequest {
        number,
        title: format!("PR {number}"),
        body: String::new(),
        labels: labels.iter().map(ToString::to_string).collect(),
        state,
        draft,
        head_ref: format!("feature-{number}"),
        mergeable: Mergeable::Mergeable,
        checks: CheckState::Success,
    }
}

/// Counts down injected failures per method name.
#[derive(Default)]
struct Failures(BTreeMap<String, u32>);

impl Failures {
    fn arm(&mut self, method: &str, times: u32) {
        self.0.insert(method.to_string(), times);
    }

    fn check(&mut self, method: &str) -> anyhow::Result<()> {
        if let Some(left) = self.0.get_mut(method)
            && *left > 0
        {
            *left -= 1;
            anyhow::bail!("injected {method} failure");
        }
        Ok(())
    }
}

#[derive(Default)]
struct GitHubState {
    issues: BTreeMap<u64, Issue>,
    prs: BTreeMap<u64, PullRequest>,
    statuses: BTreeMap<u64, PrStatus>,
    repo_labels: BTreeSet<String>,
    added: Vec<(u64, String)>,
    removed: Vec<(u64, String)>,
    comments: Vec<(u64, String)>,
    merges: Vec<(u64, MergeMethod)>,
    calls: BTreeMap<String, usize>,
    failures: Failures,
}

impl GitHubState {
    fn enter(&mut self, method: &str) -> anyhow::Result<()> {
        *self.calls.entry(method.to_string()).or_default() += 1;
        self.failures.check(method)
    }

    fn labels_mut(&mut self, number: u64) -> anyhow::Result<&mut Vec<String>> {
        if let Some(issue) = self.issues.get_mut(&number) {
            return Ok(&mut issue.labels);
        }
        if let Some(pr) = self.prs.get_mut(&number) {
            return Ok(&mut pr.labels);
        }
        anyhow::bail!("#{number} not found")
    }
}

/// GitHub double. Label transitions are atomic under one mutex.
#[derive(Default)]
pub struct FakeGitHub {
    state: Mutex<GitHubState>,
}

impl FakeGitHub {
    fn lock(&self) -> std::sync::MutexGuard<'_, GitHubState> {
        self.state.lock().unwrap()
    }

    pub fn put_issue(&self, issue: Issue) {
        self.lock().issues.insert(issue.number, issue);
    }

    pub fn put_pr(&self, pr: PullRequest) {
        self.lock().prs.insert(pr.number, pr);
    }

    /// Status returned by the live re-check, overriding the PR's own fields.
    pub fn set_pr_status(&self, status: PrStatus) {
        self.lock().statuses.insert(status.number, status);
    }

    pub fn fail_next(&self, method: &str, times: u32) {
        self.lock().failures.arm(method, times);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.lock().calls.get(method).copied().unwrap_or(0)
    }

    pub fn labels_of(&self, number: u64) -> Vec<String> {
        self.lock().labels_mut(number).map(|l| l.clone()).unwrap_or_default()
    }

    pub fn added(&self) -> Vec<(u64, String)> {
        self.lock().added.clone()
    }

    pub fn removed(&self) -> Vec<(u64, String)> {
        self.lock().removed.clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.lock().comments.clone()
    }

    pub fn merges(&self) -> Vec<(u64, MergeMethod)> {
        self.lock().merges.clone()
    }

    /// Label additions, label removals and merges issued so far.
    pub fn mutation_count(&self) -> usize {
        let state = self.lock();
        state.added.len() + state.removed.len() + state.merges.len()
    }
}

fn has_any(labels: &[String], wanted: &[String]) -> bool {
    labels.iter().any(|l| wanted.contains(l))
}

impl GitHubClient for FakeGitHub {
    fn list_issues_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<Issue>> {
        let mut state = self.lock();
        state.enter("list_issues_by_labels")?;
        Ok(state
            .issues
            .values()
            .filter(|i| i.state == ItemState::Open && has_any(&i.labels, labels))
            .cloned()
            .collect())
    }

    fn list_open_issues(&self) -> anyhow::Result<Vec<Issue>> {
        let mut state = self.lock();
        state.enter("list_open_issues")?;
        Ok(state
            .issues
            .values()
            .filter(|i| i.state == ItemState::Open)
            .cloned()
            .collect())
    }

    fn get_issue(&self, number: u64) -> anyhow::Result<Issue> {
        let mut state = self.lock();
        state.enter("get_issue")?;
        state
            .issues
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("issue #{number} not found"))
    }

    /// Returns closed and draft PRs too, so callers' filtering is exercised.
    fn list_pull_requests_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<PullRequest>> {
        let mut state = self.lock();
        state.enter("list_pull_requests_by_labels")?;
        Ok(state
            .prs
            .values()
            .filter(|p| has_any(&p.labels, labels))
            .cloned()
            .collect())
    }

    fn transition_label(&self, number: u64, from: &str, to: &str) -> anyhow::Result<bool> {
        let mut state = self.lock();
        state.enter("transition_label")?;
        let labels = state.labels_mut(number)?;
        if !labels.iter().any(|l| l == from) || labels.iter().any(|l| l == to) {
            return Ok(false);
        }
        labels.retain(|l| l != from);
        labels.push(to.to_string());
        state.added.push((number, to.to_string()));
        state.removed.push((number, from.to_string()));
        Ok(true)
    }

    fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.enter("add_label")?;
        let labels = state.labels_mut(number)?;
        if !labels.iter().any(|l| l == label) {
            labels.push(label.to_string());
        }
        state.added.push((number, label.to_string()));
        Ok(())
    }

    fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.enter("remove_label")?;
        state.labels_mut(number)?.retain(|l| l != label);
        state.removed.push((number, label.to_string()));
        Ok(())
    }

    fn create_issue_comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.enter("create_issue_comment")?;
        state.comments.push((number, body.to_string()));
        Ok(())
    }

    fn get_pull_request_status(&self, number: u64) -> anyhow::Result<PrStatus> {
        let mut state = self.lock();
        state.enter("get_pull_request_status")?;
        if let Some(status) = state.statuses.get(&number) {
            return Ok(status.clone());
        }
        let pr = state
            .prs
            .get(&number)
            .ok_or_else(|| anyhow::anyhow!("PR #{number} not found"))?;
        Ok(PrStatus {
            number,
            state: pr.state,
            draft: pr.draft,
            mergeable: pr.mergeable,
            checks: pr.checks,
        })
    }

    fn merge_pull_request(&self, number: u64, method: MergeMethod) -> anyhow::Result<()> {
        let mut state = self.lock();
        state.enter("merge_pull_request")?;
        let pr = state
            .prs
            .get_mut(&number)
            .ok_or_else(|| anyhow::anyhow!("PR #{number} not found"))?;
        pr.state = ItemState::Closed;
        if let Some(status) = state.statuses.get_mut(&number) {
            status.state = ItemState::Closed;
        }
        state.merges.push((number, method));
        Ok(())
    }

    fn get_rate_limit(&self) -> anyhow::Result<RateLimit> {
        self.lock().enter("get_rate_limit")?;
        Ok(RateLimit {
            limit: 5000,
            remaining: 4999,
            reset_at: Utc::now(),
        })
    }

    fn ensure_labels_exist(&self) -> anyhow::Result<Vec<String>> {
        let mut state = self.lock();
        state.enter("ensure_labels_exist")?;
        let mut created = Vec::new();
        for label in PhaseLabel::ALL.map(PhaseLabel::label) {
            if state.repo_labels.insert(label.clone()) {
                created.push(label);
            }
        }
        Ok(created)
    }
}

#[derive(Default)]
struct TerminalState {
    /// Session name to window names, in creation order.
    sessions: BTreeMap<String, Vec<String>>,
    created: Vec<String>,
    keys: Vec<(String, String)>,
    resizes: usize,
}

#[derive(Default)]
pub struct FakeTerminal {
    state: Mutex<TerminalState>,
}

impl FakeTerminal {
    fn lock(&self) -> std::sync::MutexGuard<'_, TerminalState> {
        self.state.lock().unwrap()
    }

    /// Pre-existing window; creates the session if needed.
    pub fn add_window(&self, session: &str, window: &str) {
        self.lock()
            .sessions
            .entry(session.to_string())
            .or_default()
            .push(window.to_string());
    }

    pub fn has_session(&self, session: &str) -> bool {
        self.lock().sessions.contains_key(session)
    }

    pub fn windows(&self, session: &str) -> Vec<String> {
        self.lock().sessions.get(session).cloned().unwrap_or_default()
    }

    /// Windows created through the trait, across sessions.
    pub fn created_windows(&self) -> Vec<String> {
        self.lock().created.clone()
    }

    pub fn sent_keys(&self) -> Vec<(String, String)> {
        self.lock().keys.clone()
    }

    pub fn resize_count(&self) -> usize {
        self.lock().resizes
    }
}

impl TerminalManager for FakeTerminal {
    fn session_exists(&self, session: &str) -> anyhow::Result<bool> {
        Ok(self.has_session(session))
    }

    fn ensure_session(&self, session: &str) -> anyhow::Result<bool> {
        let mut state = self.lock();
        if state.sessions.contains_key(session) {
            return Ok(false);
        }
        state.sessions.insert(session.to_string(), Vec::new());
        Ok(true)
    }

    fn kill_session(&self, session: &str) -> anyhow::Result<()> {
        self.lock().sessions.remove(session);
        Ok(())
    }

    fn list_windows(&self, session: &str) -> anyhow::Result<Vec<String>> {
        self.lock()
            .sessions
            .get(session)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no session {session}"))
    }

    fn create_window(&self, session: &str, window: &str, _workdir: &Path) -> anyhow::Result<()> {
        let mut state = self.lock();
        state
            .sessions
            .get_mut(session)
            .ok_or_else(|| anyhow::anyhow!("no session {session}"))?
            .push(window.to_string());
        state.created.push(window.to_string());
        Ok(())
    }

    fn kill_window(&self, session: &str, window: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        let windows = state
            .sessions
            .get_mut(session)
            .ok_or_else(|| anyhow::anyhow!("no session {session}"))?;
        let before = windows.len();
        windows.retain(|w| w != window);
        anyhow::ensure!(windows.len() < before, "no window {window}");
        Ok(())
    }

    fn send_keys(&self, target: &str, keys: &str) -> anyhow::Result<()> {
        self.lock().keys.push((target.to_string(), keys.to_string()));
        Ok(())
    }

    /// One pane per window.
    fn list_panes(&self, session: &str) -> anyhow::Result<Vec<PaneInfo>> {
        Ok(self
            .list_windows(session)?
            .into_iter()
            .map(|window| PaneInfo {
                window,
                index: 0,
                active: true,
            })
            .collect())
    }

    fn resize_panes_evenly(&self, _session: &str) -> anyhow::Result<()> {
        self.lock().resizes += 1;
        Ok(())
    }
}

#[derive(Default)]
struct WorktreeState {
    existing: BTreeSet<PathBuf>,
    dirty: BTreeSet<PathBuf>,
    created: Vec<PathBuf>,
    removed: Vec<(PathBuf, bool)>,
    fail_create: bool,
}

#[derive(Default)]
pub struct FakeWorktrees {
    state: Mutex<WorktreeState>,
}

impl FakeWorktrees {
    fn lock(&self) -> std::sync::MutexGuard<'_, WorktreeState> {
        self.state.lock().unwrap()
    }

    pub fn add_existing(&self, path: PathBuf) {
        self.lock().existing.insert(path);
    }

    pub fn set_dirty(&self, path: &Path) {
        self.lock().dirty.insert(path.to_path_buf());
    }

    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    pub fn created(&self) -> Vec<PathBuf> {
        self.lock().created.clone()
    }

    pub fn removed(&self) -> Vec<(PathBuf, bool)> {
        self.lock().removed.clone()
    }
}

impl WorktreeManager for FakeWorktrees {
    fn ensure_worktree(&self, path: &Path, _branch: &str) -> anyhow::Result<bool> {
        let mut state = self.lock();
        if state.existing.contains(path) {
            return Ok(false);
        }
        anyhow::ensure!(!state.fail_create, "injected worktree failure");
        state.existing.insert(path.to_path_buf());
        state.created.push(path.to_path_buf());
        Ok(true)
    }

    fn has_uncommitted_changes(&self, path: &Path) -> anyhow::Result<bool> {
        Ok(self.lock().dirty.contains(path))
    }

    fn remove_worktree(&self, path: &Path, force: bool) -> anyhow::Result<()> {
        let mut state = self.lock();
        anyhow::ensure!(state.existing.remove(path), "no worktree at {}", path.display());
        state.removed.push((path.to_path_buf(), force));
        Ok(())
    }

    fn list_worktrees(&self) -> anyhow::Result<Vec<PathBuf>> {
        Ok(self.lock().existing.iter().cloned().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub target: String,
    pub workdir: PathBuf,
    pub args: Vec<String>,
    pub prompt: String,
}

#[derive(Default)]
pub struct FakeAgent {
    launches: Mutex<Vec<Launch>>,
    failures: Mutex<u32>,
}

impl FakeAgent {
    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().unwrap().clone()
    }

    /// Fail the next `times` launches (still recorded as attempts).
    pub fn fail_next(&self, times: u32) {
        *self.failures.lock().unwrap() = times;
    }
}

impl crate::agent::AgentExecutor for FakeAgent {
    fn launch(&self, target: &str, workdir: &Path, args: &[String], prompt: &str) -> anyhow::Result<()> {
        self.launches.lock().unwrap().push(Launch {
            target: target.to_string(),
            workdir: workdir.to_path_buf(),
            args: args.to_vec(),
            prompt: prompt.to_string(),
        });
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            anyhow::bail!("agent failed to start in {target}");
        }
        Ok(())
    }
}

#[derive(Default)]
struct DispatcherState {
    calls: Vec<(u64, Phase)>,
    fail_for: BTreeSet<u64>,
}

/// Records dispatches without touching any provider.
#[derive(Default)]
pub struct FakeDispatcher {
    state: Mutex<DispatcherState>,
}

impl FakeDispatcher {
    pub fn calls(&self) -> Vec<(u64, Phase)> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn fail_for(&self, issue: u64) {
        self.state.lock().unwrap().fail_for.insert(issue);
    }
}

impl Dispatcher for FakeDispatcher {
    fn dispatch(&self, issue_number: u64, phase: Phase, _title: &str) -> anyhow::Result<Dispatched> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((issue_number, phase));
        anyhow::ensure!(
            !state.fail_for.contains(&issue_number),
            "injected dispatch failure for #{issue_number}"
        );
        Ok(Dispatched {
            environment: WorkEnvironment::new(Path::new("/worktrees"), issue_number, phase),
            launched: true,
        })
    }
}
