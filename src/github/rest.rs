//! Blocking GitHub client over the REST v3 API, plus one GraphQL query for
//! PR mergeability and CI rollup.

use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    CheckState, GitHubClient, GitHubError, Issue, ItemState, Mergeable, PrStatus, PullRequest,
    RateLimit, RepoRef,
};
use crate::config::{Config, MergeMethod};
use crate::labels::PhaseLabel;
use crate::subprocess::Tool;

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 10;
const USER_AGENT: &str = concat!("osoba/", env!("CARGO_PKG_VERSION"));

const PR_STATUS_QUERY: &str = r"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      number
      state
      isDraft
      mergeable
      commits(last: 1) {
        nodes { commit { statusCheckRollup { state } } }
      }
    }
  }
}";

#[derive(Debug, Deserialize)]
struct RestLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RestIssue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RestLabel>,
    state: String,
    #[serde(default)]
    pull_request: Option<Value>,
}

impl RestIssue {
    fn into_issue(self) -> Issue {
        Issue {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            state: ItemState::parse(&self.state),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestRef {
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct RestPull {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    labels: Vec<RestLabel>,
    state: String,
    #[serde(default)]
    draft: bool,
    head: RestRef,
}

impl RestPull {
    fn into_pull_request(self) -> PullRequest {
        PullRequest {
            number: self.number,
            title: self.title,
            body: self.body.unwrap_or_default(),
            labels: self.labels.into_iter().map(|l| l.name).collect(),
            state: ItemState::parse(&self.state),
            draft: self.draft,
            head_ref: self.head.ref_name,
            mergeable: Mergeable::Unknown,
            checks: CheckState::None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestRateLimit {
    resources: RestRateResources,
}

#[derive(Debug, Deserialize)]
struct RestRateResources {
    core: RestRateCore,
}

#[derive(Debug, Deserialize)]
struct RestRateCore {
    limit: u32,
    remaining: u32,
    reset: i64,
}

/// GitHub client bound to one repository.
pub struct RestClient {
    agent: ureq::Agent,
    api_url: String,
    token: String,
    repo: RepoRef,
}

impl RestClient {
    pub fn new(api_url: &str, token: String, repo: RepoRef) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(30)))
            .build()
            .into();
        Self {
            agent,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
            repo,
        }
    }

    /// Build a client from config, resolving the token from the environment
    /// or the `gh` CLI.
    pub fn from_config(config: &Config, repo: RepoRef) -> anyhow::Result<Self> {
        let token = resolve_token(&config.token_env_vars())?;
        Ok(Self::new(&config.github.api_url, token, repo))
    }

    fn repo_url(&self, path: &str) -> String {
        format!(
            "{}/repos/{}/{}{path}",
            self.api_url, self.repo.owner, self.repo.name
        )
    }

    fn graphql_url(&self) -> String {
        // GitHub Enterprise serves REST under /api/v3 and GraphQL under /api/graphql.
        self.api_url.strip_suffix("/v3").map_or_else(
            || format!("{}/graphql", self.api_url),
            |base| format!("{base}/graphql"),
        )
    }

    fn get(&self, url: &str, query: &[(&str, String)]) -> anyhow::Result<Value> {
        let mut req = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", USER_AGENT);
        for (k, v) in query {
            req = req.query(*k, v);
        }
        let body = req
            .call()
            .map_err(|e| classify(e, url))?
            .into_body()
            .read_to_string()
            .map_err(|e| classify(e, url))?;
        decode(&body, url)
    }

    fn send(&self, method: &str, url: &str, payload: &Value) -> anyhow::Result<Value> {
        let data = payload.to_string();
        let req = match method {
            "POST" => self.agent.post(url),
            "PUT" => self.agent.put(url),
            "PATCH" => self.agent.patch(url),
            other => anyhow::bail!("unsupported HTTP method {other}"),
        };
        let body = req
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json")
            .send(data.as_bytes())
            .map_err(|e| classify(e, url))?
            .into_body()
            .read_to_string()
            .map_err(|e| classify(e, url))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        decode(&body, url)
    }

    fn delete(&self, url: &str) -> anyhow::Result<()> {
        self.agent
            .delete(url)
            .header("Authorization", &format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .header("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| classify(e, url))?;
        Ok(())
    }

    /// Fetch every page of a list endpoint (bounded by `MAX_PAGES`).
    fn get_paged<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<Vec<T>> {
        let mut items = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut q = query.to_vec();
            q.push(("per_page", PER_PAGE.to_string()));
            q.push(("page", page.to_string()));
            let value = self.get(url, &q)?;
            let batch: Vec<T> = serde_json::from_value(value).map_err(|e| GitHubError::Decode {
                endpoint: url.to_string(),
                message: e.to_string(),
            })?;
            let len = batch.len();
            items.extend(batch);
            if len < PER_PAGE {
                break;
            }
        }
        Ok(items)
    }

    fn list_issues(&self, query: &[(&str, String)]) -> anyhow::Result<Vec<Issue>> {
        let raw: Vec<RestIssue> = self.get_paged(&self.repo_url("/issues"), query)?;
        Ok(raw
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .map(RestIssue::into_issue)
            .collect())
    }

    fn issue_labels(&self, number: u64) -> anyhow::Result<Vec<String>> {
        let raw: Vec<RestLabel> =
            self.get_paged(&self.repo_url(&format!("/issues/{number}/labels")), &[])?;
        Ok(raw.into_iter().map(|l| l.name).collect())
    }
}

impl GitHubClient for RestClient {
    fn list_issues_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<Issue>> {
        // The REST `labels` filter is an AND; watched labels are an OR.
        let mut seen = std::collections::HashSet::new();
        let mut issues = Vec::new();
        for label in labels {
            let batch = self
                .list_issues(&[("state", "open".to_string()), ("labels", label.clone())])
                .with_context(|| format!("listing issues labeled {label}"))?;
            for issue in batch {
                if seen.insert(issue.number) {
                    issues.push(issue);
                }
            }
        }
        Ok(issues)
    }

    fn list_open_issues(&self) -> anyhow::Result<Vec<Issue>> {
        self.list_issues(&[
            ("state", "open".to_string()),
            ("sort", "created".to_string()),
            ("direction", "asc".to_string()),
        ])
        .context("listing open issues")
    }

    fn get_issue(&self, number: u64) -> anyhow::Result<Issue> {
        let url = self.repo_url(&format!("/issues/{number}"));
        let value = self.get(&url, &[])?;
        let raw: RestIssue = serde_json::from_value(value).map_err(|e| GitHubError::Decode {
            endpoint: url,
            message: e.to_string(),
        })?;
        Ok(raw.into_issue())
    }

    fn list_pull_requests_by_labels(&self, labels: &[String]) -> anyhow::Result<Vec<PullRequest>> {
        let raw: Vec<RestPull> = self
            .get_paged(&self.repo_url("/pulls"), &[("state", "open".to_string())])
            .context("listing open pull requests")?;
        Ok(raw
            .into_iter()
            .map(RestPull::into_pull_request)
            .filter(|pr| pr.labels.iter().any(|l| labels.contains(l)))
            .collect())
    }

    fn transition_label(&self, number: u64, from: &str, to: &str) -> anyhow::Result<bool> {
        let live = self
            .issue_labels(number)
            .with_context(|| format!("re-reading labels of #{number}"))?;
        if !live.iter().any(|l| l == from) || live.iter().any(|l| l == to) {
            tracing::debug!(issue = number, from, to, ?live, "labels changed since listing, not claiming");
            return Ok(false);
        }
        self.add_label(number, to)?;
        if let Err(e) = self.remove_label(number, from) {
            // Put the trigger back on its own so the next tick can retry.
            if let Err(undo) = self.remove_label(number, to) {
                tracing::warn!(issue = number, label = to, error = %format!("{undo:#}"), "could not roll back claim");
            }
            return Err(e.context(format!("added {to} to #{number} but could not remove {from}")));
        }
        Ok(true)
    }

    fn add_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let url = self.repo_url(&format!("/issues/{number}/labels"));
        self.send("POST", &url, &json!({ "labels": [label] }))
            .with_context(|| format!("adding {label} to #{number}"))?;
        Ok(())
    }

    fn remove_label(&self, number: u64, label: &str) -> anyhow::Result<()> {
        let url = self.repo_url(&format!("/issues/{number}/labels/{}", encode_segment(label)));
        match self.delete(&url) {
            Ok(()) => Ok(()),
            // Already gone.
            Err(e) if matches!(e.downcast_ref::<GitHubError>(), Some(GitHubError::Http { status: 404, .. })) => Ok(()),
            Err(e) => Err(e.context(format!("removing {label} from #{number}"))),
        }
    }

    fn create_issue_comment(&self, number: u64, body: &str) -> anyhow::Result<()> {
        let url = self.repo_url(&format!("/issues/{number}/comments"));
        self.send("POST", &url, &json!({ "body": body }))
            .with_context(|| format!("commenting on #{number}"))?;
        Ok(())
    }

    fn get_pull_request_status(&self, number: u64) -> anyhow::Result<PrStatus> {
        let url = self.graphql_url();
        let payload = json!({
            "query": PR_STATUS_QUERY,
            "variables": {
                "owner": self.repo.owner,
                "name": self.repo.name,
                "number": number,
            },
        });
        let value = self
            .send("POST", &url, &payload)
            .with_context(|| format!("fetching status of PR #{number}"))?;
        parse_pr_status(&value, number).map_err(|message| {
            GitHubError::Decode {
                endpoint: url,
                message,
            }
            .into()
        })
    }

    fn merge_pull_request(&self, number: u64, method: MergeMethod) -> anyhow::Result<()> {
        let url = self.repo_url(&format!("/pulls/{number}/merge"));
        self.send("PUT", &url, &json!({ "merge_method": method.as_str() }))
            .with_context(|| format!("merging PR #{number}"))?;
        Ok(())
    }

    fn get_rate_limit(&self) -> anyhow::Result<RateLimit> {
        let url = format!("{}/rate_limit", self.api_url);
        let value = self.get(&url, &[])?;
        let raw: RestRateLimit = serde_json::from_value(value).map_err(|e| GitHubError::Decode {
            endpoint: url,
            message: e.to_string(),
        })?;
        let core = raw.resources.core;
        Ok(RateLimit {
            limit: core.limit,
            remaining: core.remaining,
            reset_at: DateTime::<Utc>::from_timestamp(core.reset, 0).unwrap_or_else(Utc::now),
        })
    }

    fn ensure_labels_exist(&self) -> anyhow::Result<Vec<String>> {
        let url = self.repo_url("/labels");
        let existing: Vec<RestLabel> = self.get_paged(&url, &[]).context("listing labels")?;
        let mut created = Vec::new();
        for label in PhaseLabel::ALL {
            let name = label.label();
            if existing.iter().any(|l| l.name == name) {
                continue;
            }
            self.send(
                "POST",
                &url,
                &json!({
                    "name": name,
                    "color": label.color(),
                    "description": label.description(),
                }),
            )
            .with_context(|| format!("creating label {name}"))?;
            tracing::info!(label = %name, "created label");
            created.push(name);
        }
        Ok(created)
    }
}

/// Extract mergeability and CI rollup from the GraphQL response.
fn parse_pr_status(value: &Value, number: u64) -> Result<PrStatus, String> {
    if let Some(errors) = value["errors"].as_array()
        && !errors.is_empty()
    {
        let messages: Vec<&str> = errors.iter().filter_map(|e| e["message"].as_str()).collect();
        return Err(messages.join("; "));
    }
    let pr = &value["data"]["repository"]["pullRequest"];
    if pr.is_null() {
        return Err(format!("pull request #{number} not found"));
    }
    let checks = pr["commits"]["nodes"]
        .as_array()
        .and_then(|nodes| nodes.last())
        .and_then(|node| node["commit"]["statusCheckRollup"]["state"].as_str())
        .map_or(CheckState::None, CheckState::parse);
    Ok(PrStatus {
        number,
        state: ItemState::parse(pr["state"].as_str().unwrap_or("CLOSED")),
        draft: pr["isDraft"].as_bool().unwrap_or(false),
        mergeable: Mergeable::parse(pr["mergeable"].as_str().unwrap_or("UNKNOWN")),
        checks,
    })
}

fn classify(e: ureq::Error, endpoint: &str) -> anyhow::Error {
    match e {
        ureq::Error::StatusCode(status) => GitHubError::Http {
            status,
            endpoint: endpoint.to_string(),
        }
        .into(),
        other => GitHubError::Transport {
            endpoint: endpoint.to_string(),
            message: other.to_string(),
        }
        .into(),
    }
}

fn decode(body: &str, endpoint: &str) -> anyhow::Result<Value> {
    serde_json::from_str(body).map_err(|e| {
        GitHubError::Decode {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

/// Percent-encode a label name for use as a URL path segment.
fn encode_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b':') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Token from the first non-empty env var, else `gh auth token`.
pub fn resolve_token(env_vars: &[String]) -> anyhow::Result<String> {
    for var in env_vars {
        if let Ok(token) = std::env::var(var)
            && !token.trim().is_empty()
        {
            return Ok(token.trim().to_string());
        }
    }
    if let Ok(output) = Tool::new("gh").args(&["auth", "token"]).run()
        && output.success()
        && !output.stdout.trim().is_empty()
    {
        return Ok(output.stdout.trim().to_string());
    }
    Err(GitHubError::Auth(env_vars.join(" or ")).into())
}
