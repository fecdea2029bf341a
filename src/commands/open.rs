use clap::Args;

use super::RepoArgs;
use crate::error::ExitError;
use crate::tmux::TerminalManager;

#[derive(Debug, Args)]
pub struct OpenArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
}

impl OpenArgs {
    /// Attach to the repository's tmux session.
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.repo.resolve()?;
        if !ctx.supervisor()?.is_running() {
            return Err(ExitError::NotRunning.into());
        }
        let session = ctx.session();
        let terminal = ctx.terminal();
        if !terminal.session_exists(&session)? {
            return Err(ExitError::Other(format!(
                "tmux session {session} does not exist; it is recreated on the next dispatch"
            ))
            .into());
        }
        terminal.attach(&session)
    }
}
