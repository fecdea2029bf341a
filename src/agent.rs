//! Agent executor: launches the coding agent inside a tmux pane.
//!
//! The launch is fire-and-forget. The command is typed into the pane and
//! osoba never waits for it; the agent moves the status label forward
//! itself when it is done.

use std::path::Path;
use std::sync::Arc;

use crate::tmux::TerminalManager;

pub trait AgentExecutor: Send + Sync {
    /// Start the agent in pane `target` with the phase's arguments and prompt.
    fn launch(&self, target: &str, workdir: &Path, args: &[String], prompt: &str)
    -> anyhow::Result<()>;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:@%+,".contains(&b))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Shell command line typed into the pane.
pub fn command_line(program: &str, workdir: &Path, args: &[String], prompt: &str) -> String {
    let mut parts = vec![shell_quote(program)];
    parts.extend(args.iter().map(|a| shell_quote(a)));
    parts.push(shell_quote(prompt));
    format!(
        "cd {} && {}",
        shell_quote(&workdir.to_string_lossy()),
        parts.join(" ")
    )
}

/// Runs `program` by sending its command line to a tmux pane.
pub struct PaneAgentExecutor {
    program: String,
    terminal: Arc<dyn TerminalManager>,
}

impl PaneAgentExecutor {
    pub fn new(program: &str, terminal: Arc<dyn TerminalManager>) -> Self {
        Self {
            program: program.to_string(),
            terminal,
        }
    }
}

impl AgentExecutor for PaneAgentExecutor {
    fn launch(
        &self,
        target: &str,
        workdir: &Path,
        args: &[String],
        prompt: &str,
    ) -> anyhow::Result<()> {
        let line = command_line(&self.program, workdir, args, prompt);
        tracing::debug!(target, command = %line, "launching agent");
        self.terminal.send_keys(target, &line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_only_when_needed() {
        assert_eq!(shell_quote("claude"), "claude");
        assert_eq!(shell_quote("--dangerously-skip-permissions"), "--dangerously-skip-permissions");
        assert_eq!(shell_quote("/osoba:plan 83"), "'/osoba:plan 83'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn builds_command_line() {
        let line = command_line(
            "claude",
            Path::new("/repo/.git/osoba/worktrees/issue-83"),
            &["--dangerously-skip-permissions".to_string()],
            "/osoba:plan 83",
        );
        assert_eq!(
            line,
            "cd /repo/.git/osoba/worktrees/issue-83 && claude --dangerously-skip-permissions '/osoba:plan 83'"
        );
    }

    #[test]
    fn pane_executor_types_into_target() {
        let terminal = Arc::new(crate::testing::FakeTerminal::default());
        let agent = PaneAgentExecutor::new("claude", terminal.clone());
        agent
            .launch("osoba-osoba:83-plan", Path::new("/wt/issue-83"), &[], "/osoba:plan 83")
            .unwrap();

        assert_eq!(
            terminal.sent_keys(),
            vec![(
                "osoba-osoba:83-plan".to_string(),
                "cd /wt/issue-83 && claude '/osoba:plan 83'".to_string()
            )]
        );
    }
}
