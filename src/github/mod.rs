//! GitHub client capability set and the snapshot types watchers act on.
//!
//! Watchers only ever see the [`GitHubClient`] trait; [`rest::RestClient`]
//! is the production implementation.

pub mod remote;
pub mod rest;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MergeMethod;
use crate::labels::{self, PhaseLabel};

pub use remote::RepoRef;
pub use rest::RestClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Open,
    Closed,
}

impl ItemState {
    /// Parse REST (`open`) and GraphQL (`OPEN`, `MERGED`) state strings.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("open") {
            ItemState::Open
        } else {
            ItemState::Closed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: ItemState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: ItemState,
    pub draft: bool,
    pub head_ref: String,
    pub mergeable: Mergeable,
    pub checks: CheckState,
}

impl PullRequest {
    /// Closed and draft PRs are never actioned.
    pub fn is_actionable(&self) -> bool {
        self.state == ItemState::Open && !self.draft
    }
}

/// Mergeability as reported by the GraphQL `MergeableState` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mergeable {
    Mergeable,
    Conflicting,
    Unknown,
}

impl Mergeable {
    pub fn parse(s: &str) -> Self {
        match s {
            "MERGEABLE" => Mergeable::Mergeable,
            "CONFLICTING" => Mergeable::Conflicting,
            _ => Mergeable::Unknown,
        }
    }
}

impl fmt::Display for Mergeable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mergeable::Mergeable => "MERGEABLE",
            Mergeable::Conflicting => "CONFLICTING",
            Mergeable::Unknown => "UNKNOWN",
        })
    }
}

/// Combined CI status of the head commit (`StatusState` in GraphQL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckState {
    Success,
    Failure,
    Pending,
    Error,
    Expected,
    /// No checks configured for the head commit.
    None,
}

impl CheckState {
    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => CheckState::Success,
            "FAILURE" => CheckState::Failure,
            "PENDING" => CheckState::Pending,
            "ERROR" => CheckState::Error,
            "EXPECTED" => CheckState::Expected,
            _ => CheckState::None,
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckState::Success => "SUCCESS",
            CheckState::Failure => "FAILURE",
            CheckState::Pending => "PENDING",
            CheckState::Error => "ERROR",
            CheckState::Expected => "EXPECTED",
            CheckState::None => "NONE",
        })
    }
}

/// Live status of a single PR, fetched immediately before merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub number: u64,
    pub state: ItemState,
    pub draft: bool,
    pub mergeable: Mergeable,
    pub checks: CheckState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// An issue or pull request as observed on one poll tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedItem {
    Issue(Issue),
    PullRequest(PullRequest),
}

impl WatchedItem {
    pub fn number(&self) -> u64 {
        match self {
            WatchedItem::Issue(i) => i.number,
            WatchedItem::PullRequest(p) => p.number,
        }
    }

    pub fn labels(&self) -> &[String] {
        match self {
            WatchedItem::Issue(i) => &i.labels,
            WatchedItem::PullRequest(p) => &p.labels,
        }
    }

    pub fn status_label(&self) -> Option<PhaseLabel> {
        labels::status_of(self.labels())
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            WatchedItem::Issue(_) => "issue",
            WatchedItem::PullRequest(_) => "pr",
        }
    }
}

/// Errors from the GitHub API, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum GitHubError {
    #[error("GitHub API returned HTTP {status} for {endpoint}")]
    Http { status: u16, endpoint: String },

    #[error("GitHub API request to {endpoint} failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("unexpected GitHub API response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("no GitHub token: set {0} or log in with `gh auth login`")]
    Auth(String),
}

impl GitHubError {
    /// Server errors, throttling and network failures are worth retrying.
    pub const fn is_transient(&self) -> bool {
        match self {
            GitHubError::Http { status, .. } => *status >= 500 || *status == 429,
            GitHubError::Transport { .. } => true,
            GitHubError::Decode { .. } | GitHubError::Auth(_) => false,
        }
    }
}

/// Everything the watchers, engine and cleanup manager need from GitHub.
pub trait GitHubClient: Send + Sync {
    /// Open issues carrying any of `labels`, excluding pull requests.
    fn list_issues_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<Issue>>;

    /// All open issues, excluding pull requests.
    fn list_open_issues(&self) -> anyhow::Result<Vec<Issue>>;

    fn get_issue(&self, number: u64) -> anyhow::Result<Issue>;

    /// Open pull requests carrying any of `labels`.
    fn list_pull_requests_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<PullRequest>>;

    /// Replace label `from` with `to`, only if `from` is still present and
    /// `to` is not. Returns false without mutating when that check fails.
    fn transition_label(&self, number: u64, from: &str, to: &str) -> anyhow::Result<bool>;

    fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()>;

    fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()>;

    fn create_issue_comment(&self, number: u64, body: &str) -> anyhow::Result<()>;

    fn get_pull_request_status(&self, number: u64) -> anyhow::Result<PrStatus>;

    fn merge_pull_request(&self, number: u64, method: MergeMethod) -> anyhow::Result<()>;

    fn get_rate_limit(&self) -> anyhow::Result<RateLimit>;

    /// Create any missing status labels; returns the names created.
    fn ensure_labels_exist(&self) -> anyhow::Result<Vec<String>>;
}
