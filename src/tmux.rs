//! Terminal-session provider: one tmux session per repository, one window
//! per (issue, phase).
//!
//! Window names are a pure function of issue number and phase, so they
//! double as the idempotency key for dispatch and as the discovery key for
//! cleanup and status.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::error::ExitError;
use crate::labels::Phase;
use crate::subprocess::Tool;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Window name for an (issue, phase) pair, e.g. `83-plan`.
pub fn window_name(issue: u64, phase: Phase) -> String {
    format!("{issue}-{phase}")
}

/// Inverse of [`window_name`]; `None` for windows osoba did not create.
pub fn parse_window_name(name: &str) -> Option<(u64, Phase)> {
    let (issue, phase) = name.split_once('-')?;
    Some((issue.parse().ok()?, phase.parse().ok()?))
}

/// `session:window` target string.
pub fn target(session: &str, window: &str) -> String {
    format!("{session}:{window}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub window: String,
    pub index: u32,
    pub active: bool,
}

pub trait TerminalManager: Send + Sync {
    fn session_exists(&self, session: &str) -> anyhow::Result<bool>;

    /// Create the session if missing. Returns true when it had to be created.
    fn ensure_session(&self, session: &str) -> anyhow::Result<bool>;

    fn kill_session(&self, session: &str) -> anyhow::Result<()>;

    fn list_windows(&self, session: &str) -> anyhow::Result<Vec<String>>;

    fn create_window(&self, session: &str, window: &str, workdir: &Path) -> anyhow::Result<()>;

    fn kill_window(&self, session: &str, window: &str) -> anyhow::Result<()>;

    fn send_keys(&self, target: &str, keys: &str) -> anyhow::Result<()>;

    /// Every pane of every window in the session.
    fn list_panes(&self, session: &str) -> anyhow::Result<Vec<PaneInfo>>;

    fn resize_panes_evenly(&self, session: &str) -> anyhow::Result<()>;

    fn window_exists(&self, session: &str, window: &str) -> anyhow::Result<bool> {
        if !self.session_exists(session)? {
            return Ok(false);
        }
        Ok(self.list_windows(session)?.iter().any(|w| w == window))
    }

    /// osoba windows belonging to `issue`, in any phase.
    fn windows_for_issue(&self, session: &str, issue: u64) -> anyhow::Result<Vec<String>> {
        if !self.session_exists(session)? {
            return Ok(Vec::new());
        }
        Ok(self
            .list_windows(session)?
            .into_iter()
            .filter(|w| parse_window_name(w).is_some_and(|(n, _)| n == issue))
            .collect())
    }
}

/// [`TerminalManager`] backed by the tmux CLI.
#[derive(Debug, Clone)]
pub struct TmuxManager {
    program: String,
}

impl Default for TmuxManager {
    fn default() -> Self {
        Self {
            program: "tmux".to_string(),
        }
    }
}

impl TmuxManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn tool(&self) -> Tool {
        Tool::new(&self.program).timeout(COMMAND_TIMEOUT)
    }

    /// `tmux -V`; fails with `ToolNotFound` when tmux is not installed.
    pub fn version(&self) -> anyhow::Result<String> {
        let output = self.tool().arg("-V").run_ok()?;
        Ok(output.stdout.trim().to_string())
    }

    /// Attach to the session, or switch the current client when already inside tmux.
    pub fn attach(&self, session: &str) -> anyhow::Result<()> {
        let subcommand = if std::env::var_os("TMUX").is_some() {
            "switch-client"
        } else {
            "attach-session"
        };
        let status = std::process::Command::new(&self.program)
            .args([subcommand, "-t", &format!("={session}")])
            .status()
            .with_context(|| format!("running tmux {subcommand}"))?;
        if status.success() {
            Ok(())
        } else {
            Err(ExitError::ToolFailed {
                tool: self.program.clone(),
                code: status.code().unwrap_or(-1),
                message: format!("could not attach to session {session}"),
            }
            .into())
        }
    }
}

impl TerminalManager for TmuxManager {
    fn session_exists(&self, session: &str) -> anyhow::Result<bool> {
        let output = self
            .tool()
            .args(&["has-session", "-t", &format!("={session}")])
            .run()?;
        Ok(output.success())
    }

    fn ensure_session(&self, session: &str) -> anyhow::Result<bool> {
        if self.session_exists(session)? {
            return Ok(false);
        }
        self.tool()
            .args(&["new-session", "-d", "-s", session])
            .run_ok()
            .with_context(|| format!("creating tmux session {session}"))?;
        tracing::info!(session, "created tmux session");
        Ok(true)
    }

    fn kill_session(&self, session: &str) -> anyhow::Result<()> {
        if !self.session_exists(session)? {
            return Ok(());
        }
        self.tool()
            .args(&["kill-session", "-t", &format!("={session}")])
            .run_ok()
            .with_context(|| format!("killing tmux session {session}"))?;
        Ok(())
    }

    fn list_windows(&self, session: &str) -> anyhow::Result<Vec<String>> {
        let output = self
            .tool()
            .args(&["list-windows", "-t", &format!("={session}"), "-F", "#{window_name}"])
            .run_ok()
            .with_context(|| format!("listing windows of {session}"))?;
        Ok(output.lines())
    }

    fn create_window(&self, session: &str, window: &str, workdir: &Path) -> anyhow::Result<()> {
        let workdir = workdir.to_string_lossy();
        self.tool()
            .args(&[
                "new-window",
                "-d",
                "-t",
                &format!("={session}:"),
                "-n",
                window,
                "-c",
                &workdir,
            ])
            .run_ok()
            .with_context(|| format!("creating window {window} in {session}"))?;
        Ok(())
    }

    fn kill_window(&self, session: &str, window: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["kill-window", "-t", &target(session, window)])
            .run_ok()
            .with_context(|| format!("killing window {window}"))?;
        Ok(())
    }

    fn send_keys(&self, target: &str, keys: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["send-keys", "-t", target, "-l", keys])
            .run_ok()
            .with_context(|| format!("sending keys to {target}"))?;
        self.tool()
            .args(&["send-keys", "-t", target, "Enter"])
            .run_ok()
            .with_context(|| format!("sending Enter to {target}"))?;
        Ok(())
    }

    fn list_panes(&self, session: &str) -> anyhow::Result<Vec<PaneInfo>> {
        let output = self
            .tool()
            .args(&[
                "list-panes",
                "-s",
                "-t",
                &format!("={session}"),
                "-F",
                "#{window_name}\t#{pane_index}\t#{pane_active}",
            ])
            .run_ok()
            .with_context(|| format!("listing panes of {session}"))?;
        Ok(output.lines().iter().filter_map(|l| parse_pane_line(l)).collect())
    }

    fn resize_panes_evenly(&self, session: &str) -> anyhow::Result<()> {
        self.tool()
            .args(&["select-layout", "-t", &format!("={session}"), "tiled"])
            .run_ok()
            .with_context(|| format!("re-laying out panes of {session}"))?;
        Ok(())
    }
}

fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let mut parts = line.split('\t');
    let window = parts.next()?.to_string();
    let index = parts.next()?.parse().ok()?;
    let active = parts.next()? == "1";
    Some(PaneInfo {
        window,
        index,
        active,
    })
}
