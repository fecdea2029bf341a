use std::time::Duration;

use clap::Args;

use super::RepoArgs;
use crate::daemon::StopOutcome;

#[derive(Debug, Args)]
pub struct StopArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
    /// Seconds to wait after SIGTERM before SIGKILL (default: daemon.stop_timeout_secs)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl StopArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let ctx = self.repo.resolve()?;
        let supervisor = ctx.supervisor()?;
        let timeout = Duration::from_secs(self.timeout.unwrap_or(ctx.config.daemon.stop_timeout_secs));

        match supervisor.stop(timeout)? {
            StopOutcome::Stopped { pid, forced: false } => println!("osoba stopped (pid {pid})"),
            StopOutcome::Stopped { pid, forced: true } => {
                println!("osoba killed (pid {pid} ignored SIGTERM for {}s)", timeout.as_secs());
            }
            StopOutcome::AlreadyStopped => println!("osoba is not running"),
        }
        Ok(())
    }
}
