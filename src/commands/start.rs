use std::sync::Arc;

use anyhow::Context;
use clap::Args;

use super::{RepoArgs, RepoContext};
use crate::agent::PaneAgentExecutor;
use crate::daemon;
use crate::dispatch::ActionDispatcher;
use crate::error::ExitError;
use crate::github::GitHubClient;
use crate::github::rest::resolve_token;
use crate::shutdown::Shutdown;
use crate::tmux::{TerminalManager, TmuxManager};
use crate::watcher::Orchestrator;
use crate::watcher::health::HealthSnapshot;

#[derive(Debug, Args)]
pub struct StartArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
    /// Run in the foreground instead of detaching
    #[arg(long)]
    pub foreground: bool,
}

/// Environment facts gathered before any loop starts.
#[derive(Debug)]
pub struct Preflight {
    pub tmux_version: String,
}

/// Fail fast on anything that would make every tick fail.
pub fn preflight(ctx: &RepoContext) -> anyhow::Result<Preflight> {
    let tmux_version = TmuxManager::new().version().map_err(|e| {
        match e.downcast_ref::<ExitError>() {
            Some(ExitError::ToolNotFound { .. }) => ExitError::Preflight("tmux is not installed".into()),
            _ => ExitError::Preflight(format!("tmux is not usable: {e:#}")),
        }
    })?;
    ctx.require_remote()?;
    resolve_token(&ctx.config.token_env_vars())
        .map_err(|e| ExitError::Preflight(format!("{e:#}")))?;
    Ok(Preflight { tmux_version })
}

impl StartArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.repo.resolve()?;
        if self.foreground || daemon::is_daemon_child() {
            return run_foreground(&ctx);
        }

        let checks = preflight(&ctx)?;
        tracing::debug!(tmux = %checks.tmux_version, "preflight passed");
        let supervisor = ctx.supervisor()?;
        let mut args = vec!["start".into(), "--foreground".into()];
        args.extend(self.repo.to_child_args(&ctx.root));
        let pid = supervisor.start(&ctx.root, &args)?;

        println!("osoba started (pid {pid})");
        println!("  session: {}", ctx.session());
        println!("  log:     {}", supervisor.log_file().display());
        Ok(())
    }
}

/// Run both watchers in this process until interrupted.
pub fn run_foreground(ctx: &RepoContext) -> anyhow::Result<()> {
    let checks = preflight(ctx)?;
    let remote = ctx.require_remote()?.clone();
    let supervisor = ctx.supervisor()?;
    let _record = supervisor.claim_current(&ctx.root)?;
    if let Err(e) = HealthSnapshot::clear(supervisor.health_dir()) {
        tracing::warn!(error = %format!("{e:#}"), "could not clear previous health snapshots");
    }

    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;

    let client: Arc<dyn GitHubClient> = Arc::new(ctx.github()?);
    match client.ensure_labels_exist() {
        Ok(created) if !created.is_empty() => tracing::info!(labels = ?created, "created missing status labels"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "could not verify status labels"),
    }

    let session = ctx.session();
    let terminal = ctx.terminal();
    terminal
        .ensure_session(&session)
        .with_context(|| format!("starting tmux session {session}"))?;
    let agent = Arc::new(PaneAgentExecutor::new(&ctx.config.agent.program, terminal.clone()));
    let config = Arc::new(ctx.config.clone());
    let dispatcher = Arc::new(ActionDispatcher::new(
        config.clone(),
        &remote.to_string(),
        &session,
        &ctx.worktree_base(),
        terminal,
        ctx.worktrees(),
        agent,
    ));

    tracing::info!(
        repo = %remote,
        session,
        pid = std::process::id(),
        tmux = %checks.tmux_version,
        "osoba running"
    );
    Orchestrator::new(config, client, dispatcher)
        .with_health_dir(supervisor.health_dir().to_path_buf())
        .run(&shutdown)?;
    tracing::info!("osoba stopped");
    Ok(())
}
