use clap::Args;

use super::{OutputFormat, RepoArgs};
use crate::cleanup::{CleanupManager, CleanupReport};
use crate::error::ExitError;

#[derive(Debug, Args)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
    /// Issue whose windows and worktree to remove
    #[arg(value_name = "ISSUE", conflicts_with_all = ["closed", "all"])]
    pub issue: Option<u64>,
    /// Remove resources of every issue that is closed on GitHub
    #[arg(long, conflicts_with = "all")]
    pub closed: bool,
    /// Remove every osoba window and worktree, then the session itself
    #[arg(long)]
    pub all: bool,
    /// Remove worktrees even when they have uncommitted changes
    #[arg(long)]
    pub force: bool,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

impl CleanupArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.repo.resolve()?;
        let manager = CleanupManager::new(
            &ctx.session(),
            &ctx.worktree_base(),
            ctx.terminal(),
            ctx.worktrees(),
        );

        let report = if let Some(number) = self.issue {
            manager.cleanup_issue(number, self.force)
        } else if self.closed {
            let client = ctx.github()?;
            manager.cleanup_closed(&client, self.force)?
        } else if self.all {
            manager.cleanup_all(self.force)?
        } else {
            return Err(ExitError::Other(
                "nothing to clean: pass an ISSUE number, --closed or --all".into(),
            )
            .into());
        };

        match OutputFormat::resolve(self.format) {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Pretty | OutputFormat::Text => print_report(&report),
        }

        if report.is_clean() {
            Ok(())
        } else {
            Err(ExitError::Other(format!("cleanup finished with {} error(s)", report.errors.len())).into())
        }
    }
}

fn print_report(report: &CleanupReport) {
    println!(
        "Removed {} window(s) and {} worktree(s)",
        report.windows_killed, report.worktrees_removed
    );
    for skipped in &report.skipped {
        println!("  kept {skipped} (use --force to remove)");
    }
    for error in &report.errors {
        eprintln!("  error: {error}");
    }
}
