//! Action dispatcher: turns a claimed (issue, phase) into a running agent.
//!
//! Every step is idempotent. The worktree path and window name are pure
//! functions of the issue number and phase, so dispatching the same pair
//! twice finds what the first call created and launches nothing new.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::agent::AgentExecutor;
use crate::config::Config;
use crate::labels::Phase;
use crate::template::{self, PromptContext};
use crate::tmux::{self, TerminalManager};
use crate::worktree::{self, WorktreeManager};

/// Where one (issue, phase) runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkEnvironment {
    pub issue_number: u64,
    pub phase: Phase,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub window_name: String,
}

impl WorkEnvironment {
    pub fn new(worktree_base: &Path, issue_number: u64, phase: Phase) -> Self {
        Self {
            issue_number,
            phase,
            worktree_path: worktree::worktree_path(worktree_base, issue_number),
            branch_name: worktree::branch_name(issue_number),
            window_name: tmux::window_name(issue_number, phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub environment: WorkEnvironment,
    /// False when the window already existed and the agent was left alone.
    pub launched: bool,
}

/// Seam between the watchers and the concrete providers.
pub trait Dispatcher: Send + Sync {
    /// Prepare the work environment for `issue_number` and start the agent
    /// for `phase` in it. `title` is exposed to the prompt template.
    fn dispatch(&self, issue_number: u64, phase: Phase, title: &str) -> anyhow::Result<Dispatched>;
}

pub struct ActionDispatcher {
    config: Arc<Config>,
    repo: String,
    session: String,
    worktree_base: PathBuf,
    terminal: Arc<dyn TerminalManager>,
    worktrees: Arc<dyn WorktreeManager>,
    agent: Arc<dyn AgentExecutor>,
}

impl ActionDispatcher {
    /// `repo` is the `owner/name` shown to prompts; `session` the tmux session.
    pub fn new(
        config: Arc<Config>,
        repo: &str,
        session: &str,
        worktree_base: &Path,
        terminal: Arc<dyn TerminalManager>,
        worktrees: Arc<dyn WorktreeManager>,
        agent: Arc<dyn AgentExecutor>,
    ) -> Self {
        Self {
            config,
            repo: repo.to_string(),
            session: session.to_string(),
            worktree_base: worktree_base.to_path_buf(),
            terminal,
            worktrees,
            agent,
        }
    }

    fn rebalance_panes(&self) {
        let panes = match self.terminal.list_panes(&self.session) {
            Ok(panes) => panes.len(),
            Err(e) => {
                tracing::warn!(session = %self.session, error = %format!("{e:#}"), "could not count panes");
                return;
            }
        };
        if panes > self.config.tmux.max_panes
            && let Err(e) = self.terminal.resize_panes_evenly(&self.session)
        {
            tracing::warn!(session = %self.session, panes, error = %format!("{e:#}"), "could not resize panes");
        }
    }
}

impl ActionDispatcher {
    fn start_agent(&self, env: &WorkEnvironment, title: &str) -> anyhow::Result<()> {
        let phase = env.phase;
        let phase_config = self.config.phase(phase);
        let ctx = PromptContext::new(env.issue_number, title, &self.repo, phase);
        let prompt = template::render_prompt(&phase_config.prompt, &ctx)
            .with_context(|| format!("rendering {phase} prompt"))?;
        self.agent
            .launch(
                &tmux::target(&self.session, &env.window_name),
                &env.worktree_path,
                &phase_config.args,
                &prompt,
            )
            .with_context(|| format!("launching agent in {}", env.window_name))
    }
}

impl Dispatcher for ActionDispatcher {
    fn dispatch(&self, issue_number: u64, phase: Phase, title: &str) -> anyhow::Result<Dispatched> {
        let env = WorkEnvironment::new(&self.worktree_base, issue_number, phase);

        self.worktrees
            .ensure_worktree(&env.worktree_path, &env.branch_name)
            .with_context(|| format!("preparing worktree for #{issue_number}"))?;

        if self.terminal.ensure_session(&self.session)? {
            tracing::info!(session = %self.session, "tmux session was missing, recreated");
        }

        let launched = if self.terminal.window_exists(&self.session, &env.window_name)? {
            tracing::info!(issue = issue_number, %phase, window = %env.window_name, "window exists, not relaunching");
            false
        } else {
            self.terminal
                .create_window(&self.session, &env.window_name, &env.worktree_path)
                .with_context(|| format!("creating window {}", env.window_name))?;
            if let Err(e) = self.start_agent(&env, title) {
                // An empty window would read as "already running" next time.
                if let Err(undo) = self.terminal.kill_window(&self.session, &env.window_name) {
                    tracing::warn!(window = %env.window_name, error = %format!("{undo:#}"), "could not remove window after failed launch");
                }
                return Err(e);
            }
            tracing::info!(issue = issue_number, %phase, window = %env.window_name, "agent launched");
            true
        };

        self.rebalance_panes();

        Ok(Dispatched {
            environment: env,
            launched,
        })
    }
}
