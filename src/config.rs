use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;
use crate::labels::{Phase, PhaseLabel};

/// Config file name, looked up at the repository root.
pub const CONFIG_FILE: &str = ".osoba.toml";

const MAX_POLL_INTERVAL_SECS: u64 = 86_400;
const MAX_RETRY_ATTEMPTS: u32 = 10;
const MAX_BASE_DELAY_MS: u64 = 60_000;
/// Upper bound for the remaining second-valued settings: one week.
const MAX_DURATION_SECS: u64 = 7 * 86_400;

/// Top-level .osoba.toml config.
///
/// Every section is optional; a repository without a config file runs on
/// the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub worktree: WorktreeConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GitHubConfig {
    /// Seconds between poll ticks (both watchers).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Issue labels the issue watcher lists on every tick.
    #[serde(default = "default_issue_labels")]
    pub issue_labels: Vec<String>,
    /// Pull request labels the PR watcher lists on every tick.
    #[serde(default = "default_pr_labels")]
    pub pr_labels: Vec<String>,
    /// Merge open, non-draft PRs labeled `status:lgtm` once mergeable and green.
    #[serde(default = "default_true")]
    pub auto_merge_lgtm: bool,
    /// Dispatch a revise phase for PRs labeled `status:requires-changes`.
    #[serde(default = "default_true")]
    pub auto_revise_pr: bool,
    /// Label the oldest unlabeled open issue `status:needs-plan` when idle.
    #[serde(default)]
    pub auto_plan_issue: bool,
    /// Comment on the issue when a phase is claimed.
    #[serde(default = "default_true")]
    pub phase_comments: bool,
    #[serde(default)]
    pub merge_method: MergeMethod,
    /// Environment variable holding the API token (GITHUB_TOKEN, GH_TOKEN if unset).
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            issue_labels: default_issue_labels(),
            pr_labels: default_pr_labels(),
            auto_merge_lgtm: true,
            auto_revise_pr: true,
            auto_plan_issue: false,
            phase_comments: true,
            merge_method: MergeMethod::default(),
            token_env: None,
            api_url: default_api_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    #[default]
    Squash,
    Rebase,
}

impl MergeMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            MergeMethod::Merge => "merge",
            MergeMethod::Squash => "squash",
            MergeMethod::Rebase => "rebase",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TmuxConfig {
    /// Session name is `{session_prefix}{repo}`.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Panes in the session above which panes are re-laid out evenly.
    #[serde(default = "default_max_panes")]
    pub max_panes: usize,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            max_panes: default_max_panes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorktreeConfig {
    /// Directory holding `issue-N` checkouts. Relative paths resolve against
    /// the repository root; defaults to `.git/osoba/worktrees`.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Branch new issue branches are created from.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            base_branch: default_base_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentConfig {
    /// Agent program launched inside each window.
    #[serde(default = "default_agent_program")]
    pub program: String,
    #[serde(default)]
    pub phases: PhasesConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_agent_program(),
            phases: PhasesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PhasesConfig {
    #[serde(default = "default_plan_phase")]
    pub plan: PhaseConfig,
    #[serde(default = "default_implement_phase")]
    pub implement: PhaseConfig,
    #[serde(default = "default_review_phase")]
    pub review: PhaseConfig,
    #[serde(default = "default_revise_phase")]
    pub revise: PhaseConfig,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            plan: default_plan_phase(),
            implement: default_implement_phase(),
            review: default_review_phase(),
            revise: default_revise_phase(),
        }
    }
}

/// Argument list and prompt template for one phase.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PhaseConfig {
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HealthConfig {
    /// A watcher with no execution for this long is reported unhealthy.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Success-rate floor (0.0..=1.0).
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonConfig {
    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

// Default value functions for serde
fn default_poll_interval() -> u64 { 10 }
fn default_issue_labels() -> Vec<String> {
    [PhaseLabel::NeedsPlan, PhaseLabel::Ready, PhaseLabel::ReviewRequested]
        .iter()
        .map(|l| l.label())
        .collect()
}
fn default_pr_labels() -> Vec<String> {
    [PhaseLabel::Lgtm, PhaseLabel::RequiresChanges]
        .iter()
        .map(|l| l.label())
        .collect()
}
fn default_true() -> bool { true }
fn default_api_url() -> String { "https://api.github.com".into() }
fn default_session_prefix() -> String { "osoba-".into() }
fn default_max_panes() -> usize { 3 }
fn default_base_branch() -> String { "main".into() }
fn default_agent_program() -> String { "claude".into() }
fn default_agent_args() -> Vec<String> { vec!["--dangerously-skip-permissions".into()] }
fn default_stale_after() -> u64 { 300 }
fn default_min_success_rate() -> f64 { 0.5 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_delay_ms() -> u64 { 500 }
fn default_stop_timeout() -> u64 { 10 }

fn phase_with_prompt(prompt: &str) -> PhaseConfig {
    PhaseConfig {
        args: default_agent_args(),
        prompt: prompt.to_string(),
    }
}
fn default_plan_phase() -> PhaseConfig { phase_with_prompt("/osoba:plan {{issue-number}}") }
fn default_implement_phase() -> PhaseConfig { phase_with_prompt("/osoba:implement {{issue-number}}") }
fn default_review_phase() -> PhaseConfig { phase_with_prompt("/osoba:review {{issue-number}}") }
fn default_revise_phase() -> PhaseConfig { phase_with_prompt("/osoba:revise {{issue-number}}") }

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    /// Load `explicit`, or `.osoba.toml` under `repo_root`, or fall back to defaults.
    pub fn load_for_repo(repo_root: &Path, explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let path = repo_root.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parse config from a TOML string.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_FILE}: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&self.github.poll_interval_secs) {
            return Err(ExitError::Config(format!(
                "github.poll_interval_secs must be between 1 and {MAX_POLL_INTERVAL_SECS}"
            ))
            .into());
        }
        if !(0.0..=1.0).contains(&self.health.min_success_rate) {
            return Err(ExitError::Config(
                "health.min_success_rate must be between 0.0 and 1.0".into(),
            )
            .into());
        }
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.retry.max_attempts) {
            return Err(ExitError::Config(format!(
                "retry.max_attempts must be between 1 and {MAX_RETRY_ATTEMPTS}"
            ))
            .into());
        }
        if self.retry.base_delay_ms > MAX_BASE_DELAY_MS {
            return Err(ExitError::Config(format!(
                "retry.base_delay_ms must be at most {MAX_BASE_DELAY_MS}"
            ))
            .into());
        }
        if self.health.stale_after_secs > MAX_DURATION_SECS || self.daemon.stop_timeout_secs > MAX_DURATION_SECS {
            return Err(ExitError::Config(format!(
                "health.stale_after_secs and daemon.stop_timeout_secs must be at most {MAX_DURATION_SECS}"
            ))
            .into());
        }
        Ok(())
    }

    /// Serialize config to a TOML string with helpful comments.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        let raw = toml::to_string_pretty(self).context("serializing config to TOML")?;

        let mut doc: toml_edit::DocumentMut = raw
            .parse()
            .context("parsing generated TOML for comment injection")?;

        doc.decor_mut()
            .set_prefix("# osoba configuration\n# Status labels drive everything: status:needs-plan -> planning -> ready -> ...\n\n");

        fn set_table_comment(doc: &mut toml_edit::DocumentMut, key: &str, comment: &str) {
            if let Some(item) = doc.get_mut(key)
                && let Some(tbl) = item.as_table_mut()
            {
                tbl.decor_mut().set_prefix(comment);
            }
        }

        set_table_comment(&mut doc, "github", "\n# Polling and automation switches\n");
        set_table_comment(&mut doc, "tmux", "\n# One session per repository, one window per (issue, phase)\n");
        set_table_comment(&mut doc, "worktree", "\n# One git worktree per issue, on branch osoba/#N\n");
        set_table_comment(&mut doc, "agent", "\n# Agent program and per-phase arguments and prompts\n# Prompts may use {{issue-number}}, {{ issue_title }}, {{ repo }}, {{ phase }}\n");
        set_table_comment(&mut doc, "health", "\n# Thresholds for the watcher health check\n");
        set_table_comment(&mut doc, "retry", "\n# Bounded retry for GitHub API calls within one tick\n");
        set_table_comment(&mut doc, "daemon", "\n# Background process supervision\n");

        Ok(doc.to_string())
    }

    pub fn phase(&self, phase: Phase) -> &PhaseConfig {
        match phase {
            Phase::Plan => &self.agent.phases.plan,
            Phase::Implement => &self.agent.phases.implement,
            Phase::Review => &self.agent.phases.review,
            Phase::Revise => &self.agent.phases.revise,
        }
    }

    /// tmux session name for a repository.
    pub fn session_name(&self, repo: &str) -> String {
        format!("{}{repo}", self.tmux.session_prefix)
    }

    /// Directory holding per-issue worktrees.
    pub fn worktree_base(&self, repo_root: &Path) -> PathBuf {
        match self.worktree.base_dir {
            Some(ref dir) if dir.is_absolute() => dir.clone(),
            Some(ref dir) => repo_root.join(dir),
            None => repo_root.join(".git").join("osoba").join("worktrees"),
        }
    }

    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.github.poll_interval_secs)
    }

    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.health.stale_after_secs)
    }

    /// Environment variables consulted for the GitHub token, in order.
    pub fn token_env_vars(&self) -> Vec<String> {
        match self.github.token_env {
            Some(ref name) => vec![name.clone()],
            None => vec!["GITHUB_TOKEN".into(), "GH_TOKEN".into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.github.poll_interval_secs, 10);
        assert_eq!(
            config.github.issue_labels,
            vec!["status:needs-plan", "status:ready", "status:review-requested"]
        );
        assert_eq!(
            config.github.pr_labels,
            vec!["status:lgtm", "status:requires-changes"]
        );
        assert!(config.github.auto_merge_lgtm);
        assert!(config.github.auto_revise_pr);
        assert!(!config.github.auto_plan_issue);
        assert_eq!(config.github.merge_method, MergeMethod::Squash);
        assert_eq!(config.tmux.max_panes, 3);
        assert_eq!(config.agent.program, "claude");
        assert_eq!(config.phase(Phase::Plan).prompt, "/osoba:plan {{issue-number}}");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[github]
poll_interval_secs = 30
issue_labels = ["status:ready"]
auto_merge_lgtm = false
auto_plan_issue = true
merge_method = "rebase"
token_env = "OSOBA_TOKEN"

[tmux]
session_prefix = "bots-"
max_panes = 6

[worktree]
base_dir = "/tmp/wt"
base_branch = "develop"

[agent]
program = "codex"

[agent.phases.implement]
args = ["--full-auto"]
prompt = "implement {{issue-number}}"

[health]
stale_after_secs = 60
min_success_rate = 0.8
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.github.issue_labels, vec!["status:ready"]);
        assert!(!config.github.auto_merge_lgtm);
        assert!(config.github.auto_revise_pr);
        assert!(config.github.auto_plan_issue);
        assert_eq!(config.github.merge_method, MergeMethod::Rebase);
        assert_eq!(config.token_env_vars(), vec!["OSOBA_TOKEN"]);
        assert_eq!(config.session_name("demo"), "bots-demo");
        assert_eq!(config.worktree_base(Path::new("/repo")), PathBuf::from("/tmp/wt"));
        assert_eq!(config.worktree.base_branch, "develop");
        assert_eq!(config.agent.program, "codex");
        assert_eq!(config.phase(Phase::Implement).args, vec!["--full-auto"]);
        // untouched phases keep their defaults
        assert_eq!(config.phase(Phase::Review).prompt, "/osoba:review {{issue-number}}");
        assert!((config.health.min_success_rate - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn default_worktree_base_is_inside_git_dir() {
        let config = Config::default();
        assert_eq!(
            config.worktree_base(Path::new("/repo")),
            PathBuf::from("/repo/.git/osoba/worktrees")
        );
    }

    #[test]
    fn relative_worktree_base_resolves_against_repo() {
        let config = Config::parse_toml("[worktree]\nbase_dir = \"wt\"\n").unwrap();
        assert_eq!(config.worktree_base(Path::new("/repo")), PathBuf::from("/repo/wt"));
    }

    #[test]
    fn parse_malformed_toml() {
        let err = Config::parse_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("invalid .osoba.toml"));
        assert!(matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Config(_))));
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Config::parse_toml("[github]\npoll_interval_secs = 0\n").is_err());
        assert!(Config::parse_toml("[health]\nmin_success_rate = 1.5\n").is_err());
        assert!(Config::parse_toml("[retry]\nmax_attempts = 0\n").is_err());
    }

    #[test]
    fn rejects_values_too_large_to_schedule() {
        for toml_str in [
            "[github]\npoll_interval_secs = 9223372036854775807\n",
            "[retry]\nmax_attempts = 4000000000\n",
            "[retry]\nbase_delay_ms = 9223372036854775807\n",
            "[daemon]\nstop_timeout_secs = 9223372036854775807\n",
            "[health]\nstale_after_secs = 9223372036854775807\n",
        ] {
            let err = Config::parse_toml(toml_str).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<ExitError>(), Some(ExitError::Config(_))),
                "{toml_str}: {err:#}"
            );
        }
        assert!(Config::parse_toml("[github]\npoll_interval_secs = 86400\n").is_ok());
    }

    #[test]
    fn roundtrip_toml() {
        let mut config = Config::default();
        config.github.auto_plan_issue = true;
        config.tmux.max_panes = 5;
        let output = config.to_toml().unwrap();
        let config2 = Config::parse_toml(&output).unwrap();
        assert!(config2.github.auto_plan_issue);
        assert_eq!(config2.tmux.max_panes, 5);
        assert_eq!(config2.agent.phases.revise.prompt, config.agent.phases.revise.prompt);
    }

    #[test]
    fn to_toml_includes_comments() {
        let output = Config::default().to_toml().unwrap();
        assert!(output.contains("# osoba configuration"));
        assert!(output.contains("# Polling and automation switches"));
    }

    #[test]
    fn load_for_repo_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_for_repo(dir.path(), None).unwrap();
        assert_eq!(config.github.poll_interval_secs, 10);

        std::fs::write(dir.path().join(CONFIG_FILE), "[github]\npoll_interval_secs = 42\n").unwrap();
        let config = Config::load_for_repo(dir.path(), None).unwrap();
        assert_eq!(config.github.poll_interval_secs, 42);
    }
}
