use std::process::ExitCode;

use clap::{Parser, Subcommand};

use osoba::commands::{
    self, cleanup::CleanupArgs, init::InitArgs, open::OpenArgs, start::StartArgs, status::StatusArgs,
    stop::StopArgs,
};
use osoba::{error, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "osoba",
    version,
    about = "Label-driven GitHub issue automation with tmux, git worktrees and AI agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write .osoba.toml and create the status labels
    Init(InitArgs),
    /// Start watching the repository (detaches unless --foreground)
    Start(StartArgs),
    /// Stop the background watcher
    Stop(StopArgs),
    /// Show daemon, session and rate limit status
    Status(StatusArgs),
    /// Remove windows and worktrees of finished issues
    Cleanup(CleanupArgs),
    /// Attach to the repository's tmux session
    Open(OpenArgs),
    /// Print the JSON Schema for .osoba.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Start(_) => "start",
            Self::Stop(_) => "stop",
            Self::Status(_) => "status",
            Self::Cleanup(_) => "cleanup",
            Self::Open(_) => "open",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let result = match cli.command {
        Commands::Init(args) => args.execute(),
        Commands::Start(args) => args.execute(),
        Commands::Stop(args) => args.execute(),
        Commands::Status(args) => args.execute(),
        Commands::Cleanup(args) => args.execute(),
        Commands::Open(args) => args.execute(),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(exit_err) = e.downcast_ref::<error::ExitError>() {
                eprintln!("error: {exit_err}");
                exit_err.exit_code()
            } else {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        }
    }
}
