//! PR watcher: merges approved pull requests and sends changes-requested
//! pull requests back to the agent.

use std::sync::{Arc, OnceLock};

use chrono::Utc;

use super::Watcher;
use super::health::{AutoMergeMetrics, HealthStats};
use super::retry::{RetryPolicy, with_retry};
use crate::config::{Config, MergeMethod};
use crate::dispatch::Dispatcher;
use crate::github::{CheckState, GitHubClient, ItemState, Mergeable, PrStatus, PullRequest, WatchedItem};
use crate::labels::{self, Phase, PhaseLabel};
use crate::shutdown::Shutdown;
use crate::transition::TransitionEngine;

/// What to do with an approved PR given its freshly fetched status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeDecision {
    Merge,
    /// GitHub has not finished computing; look again next tick.
    Defer,
    /// Not mergeable; the reason is the metrics bucket.
    Reject(String),
}

pub fn merge_decision(status: &PrStatus) -> MergeDecision {
    if status.state != ItemState::Open {
        return MergeDecision::Reject("state:closed".into());
    }
    if status.draft {
        return MergeDecision::Reject("state:draft".into());
    }
    match status.mergeable {
        Mergeable::Mergeable => {}
        Mergeable::Unknown => return MergeDecision::Defer,
        Mergeable::Conflicting => return MergeDecision::Reject(format!("mergeable:{}", status.mergeable)),
    }
    match status.checks {
        CheckState::Success => MergeDecision::Merge,
        CheckState::Pending | CheckState::Expected => MergeDecision::Defer,
        CheckState::Failure | CheckState::Error | CheckState::None => {
            MergeDecision::Reject(format!("checks:{}", status.checks))
        }
    }
}

fn re_branch() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^osoba/#(\d+)$").unwrap())
}

fn re_closing_keyword() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\s*:?\s+#(\d+)\b").unwrap()
    })
}

/// Issue a PR works on: its `osoba/#N` head branch, else the first closing
/// keyword in the body, else the PR itself.
pub fn linked_issue(pr: &PullRequest) -> u64 {
    re_branch()
        .captures(&pr.head_ref)
        .or_else(|| re_closing_keyword().captures(&pr.body))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(pr.number)
}

pub struct PrWatcher {
    client: Arc<dyn GitHubClient>,
    engine: TransitionEngine,
    dispatcher: Arc<dyn Dispatcher>,
    labels: Vec<String>,
    auto_merge: bool,
    auto_revise: bool,
    merge_method: MergeMethod,
    retry: RetryPolicy,
    stats: HealthStats,
    metrics: AutoMergeMetrics,
}

impl PrWatcher {
    pub fn new(config: &Config, client: Arc<dyn GitHubClient>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            engine: TransitionEngine::new(client.clone(), config.github.phase_comments),
            client,
            dispatcher,
            labels: config.github.pr_labels.clone(),
            auto_merge: config.github.auto_merge_lgtm,
            auto_revise: config.github.auto_revise_pr,
            merge_method: config.github.merge_method,
            retry: RetryPolicy::from_config(&config.retry),
            stats: HealthStats::new(Utc::now()),
            metrics: AutoMergeMetrics::default(),
        }
    }

    pub const fn metrics(&self) -> &AutoMergeMetrics {
        &self.metrics
    }

    pub fn poll(&mut self, shutdown: &Shutdown) {
        let prs = match with_retry(&self.retry, shutdown, "list pull requests", || {
            self.client.list_pull_requests_by_labels(&self.labels)
        }) {
            Ok(prs) => prs,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "listing pull requests failed");
                self.stats.record_failure(Utc::now());
                return;
            }
        };

        for pr in prs {
            if shutdown.is_triggered() {
                break;
            }
            if !pr.is_actionable() {
                tracing::debug!(pr = pr.number, draft = pr.draft, state = ?pr.state, "skipping");
                continue;
            }
            let status = labels::interrupted_claim(&pr.labels).or_else(|| labels::status_of(&pr.labels));
            match status {
                Some(PhaseLabel::Lgtm) if self.auto_merge => self.try_merge(&pr, shutdown),
                Some(PhaseLabel::RequiresChanges) if self.auto_revise => self.revise(pr),
                _ => {}
            }
        }
    }

    fn try_merge(&mut self, pr: &PullRequest, shutdown: &Shutdown) {
        let number = pr.number;
        let status = match with_retry(&self.retry, shutdown, "get pull request status", || {
            self.client.get_pull_request_status(number)
        }) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pr = number, error = %format!("{e:#}"), "status re-check failed");
                self.stats.record_failure(Utc::now());
                return;
            }
        };

        match merge_decision(&status) {
            MergeDecision::Defer => {
                tracing::debug!(pr = number, mergeable = %status.mergeable, checks = %status.checks, "merge deferred");
            }
            MergeDecision::Reject(reason) => {
                tracing::info!(pr = number, %reason, "not merging");
                self.metrics.record_failure(&reason);
            }
            MergeDecision::Merge => match with_retry(&self.retry, shutdown, "merge pull request", || {
                self.client.merge_pull_request(number, self.merge_method)
            }) {
                Ok(()) => {
                    tracing::info!(pr = number, method = self.merge_method.as_str(), "merged");
                    self.metrics.record_success();
                    self.stats.record_success(Utc::now());
                }
                Err(e) => {
                    tracing::error!(pr = number, error = %format!("{e:#}"), "merge failed");
                    self.metrics.record_failure("merge-error");
                    self.stats.record_failure(Utc::now());
                }
            },
        }
    }

    fn revise(&mut self, pr: PullRequest) {
        let number = pr.number;
        let issue = linked_issue(&pr);
        let title = pr.title.clone();
        match self.engine.claim_and_advance(&WatchedItem::PullRequest(pr)) {
            Ok(Some(result)) if result.claimed => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(pr = number, error = %format!("{e:#}"), "claim failed");
                self.stats.record_failure(Utc::now());
                return;
            }
        }
        match self.dispatcher.dispatch(issue, Phase::Revise, &title) {
            Ok(dispatched) => {
                tracing::info!(pr = number, issue, window = %dispatched.environment.window_name, "revision dispatched");
                self.stats.record_success(Utc::now());
            }
            Err(e) => {
                tracing::error!(pr = number, issue, error = %format!("{e:#}"), "revision dispatch failed");
                self.stats.record_failure(Utc::now());
            }
        }
    }
}

impl Watcher for PrWatcher {
    fn name(&self) -> &'static str {
        "pr"
    }

    fn tick(&mut self, shutdown: &Shutdown) {
        self.poll(shutdown);
        tracing::debug!(
            merges = self.metrics.successful_merges,
            merge_failures = self.metrics.failed_merges,
            "pr tick done"
        );
    }

    fn stats(&self) -> &HealthStats {
        &self.stats
    }

    fn auto_merge(&self) -> Option<&AutoMergeMetrics> {
        Some(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDispatcher, FakeGitHub, pull_request};

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.retry.base_delay_ms = 1;
        config
    }

    fn status(mergeable: Mergeable, checks: CheckState) -> PrStatus {
        PrStatus {
            number: 123,
            state: ItemState::Open,
            draft: false,
            mergeable,
            checks,
        }
    }

    fn watcher(config: &Config, github: &Arc<FakeGitHub>, dispatcher: &Arc<FakeDispatcher>) -> PrWatcher {
        PrWatcher::new(config, github.clone(), dispatcher.clone())
    }

    #[test]
    fn approved_pr_is_merged_once_end_to_end() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert_eq!(github.merges(), vec![(123, MergeMethod::Squash)]);
        assert_eq!(watcher.metrics().successful_merges, 1);
        assert_eq!(watcher.metrics().total_attempts, 1);
        assert_eq!(watcher.stats().successful_executions, 1);

        watcher.poll(&Shutdown::new());
        assert_eq!(github.merges().len(), 1);
    }

    #[test]
    fn draft_and_closed_prs_are_never_actioned() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(1, &["status:lgtm"], ItemState::Open, true));
        github.put_pr(pull_request(2, &["status:lgtm"], ItemState::Closed, false));
        github.put_pr(pull_request(3, &["status:requires-changes"], ItemState::Open, true));
        github.put_pr(pull_request(4, &["status:requires-changes"], ItemState::Closed, false));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert!(github.merges().is_empty());
        assert!(dispatcher.calls().is_empty());
        assert_eq!(github.call_count("get_pull_request_status"), 0);
        assert_eq!(github.mutation_count(), 0);
        assert_eq!(watcher.metrics().total_attempts, 0);
    }

    #[test]
    fn merge_requires_a_fresh_mergeable_and_green_status() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        github.set_pr_status(status(Mergeable::Conflicting, CheckState::Success));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert_eq!(github.call_count("get_pull_request_status"), 1);
        assert!(github.merges().is_empty());
        assert_eq!(watcher.metrics().failed_merges, 1);
        assert_eq!(watcher.metrics().failure_reasons["mergeable:CONFLICTING"], 1);
    }

    #[test]
    fn pending_checks_defer_without_counting_an_attempt() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        github.set_pr_status(status(Mergeable::Mergeable, CheckState::Pending));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());
        assert!(github.merges().is_empty());
        assert_eq!(watcher.metrics().total_attempts, 0);

        github.set_pr_status(status(Mergeable::Mergeable, CheckState::Success));
        watcher.poll(&Shutdown::new());
        assert_eq!(github.merges().len(), 1);
    }

    #[test]
    fn merge_api_failure_is_bucketed() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        github.fail_next("merge_pull_request", 3);
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert_eq!(github.call_count("merge_pull_request"), 3);
        assert_eq!(watcher.metrics().failure_reasons["merge-error"], 1);
        assert_eq!(watcher.stats().failed_executions, 1);
    }

    #[test]
    fn transient_merge_failure_is_retried() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        github.fail_next("merge_pull_request", 1);
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert_eq!(github.call_count("merge_pull_request"), 2);
        assert_eq!(github.merges().len(), 1);
        assert_eq!(watcher.metrics().successful_merges, 1);
        assert!(watcher.metrics().failure_reasons.is_empty());
    }

    #[test]
    fn auto_merge_can_be_disabled() {
        let github = Arc::new(FakeGitHub::default());
        github.put_pr(pull_request(123, &["status:lgtm"], ItemState::Open, false));
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut config = quick_config();
        config.github.auto_merge_lgtm = false;
        let mut watcher = watcher(&config, &github, &dispatcher);

        watcher.poll(&Shutdown::new());
        assert!(github.merges().is_empty());
        assert_eq!(github.call_count("get_pull_request_status"), 0);
    }

    #[test]
    fn requires_changes_claims_and_dispatches_revise_for_linked_issue() {
        let github = Arc::new(FakeGitHub::default());
        let mut pr = pull_request(130, &["status:requires-changes"], ItemState::Open, false);
        pr.head_ref = "osoba/#83".into();
        github.put_pr(pr);
        let dispatcher = Arc::new(FakeDispatcher::default());
        let mut watcher = watcher(&quick_config(), &github, &dispatcher);

        watcher.poll(&Shutdown::new());

        assert_eq!(github.labels_of(130), vec!["status:revising".to_string()]);
        assert_eq!(dispatcher.calls(), vec![(83, Phase::Revise)]);
        assert_eq!(watcher.stats().successful_executions, 1);

        watcher.poll(&Shutdown::new());
        assert_eq!(dispatcher.calls().len(), 1);
    }

    #[test]
    fn merge_decision_table() {
        use MergeDecision::{Defer, Merge, Reject};
        assert_eq!(merge_decision(&status(Mergeable::Mergeable, CheckState::Success)), Merge);
        assert_eq!(merge_decision(&status(Mergeable::Unknown, CheckState::Success)), Defer);
        assert_eq!(merge_decision(&status(Mergeable::Mergeable, CheckState::Expected)), Defer);
        assert_eq!(
            merge_decision(&status(Mergeable::Mergeable, CheckState::Failure)),
            Reject("checks:FAILURE".into())
        );
        assert_eq!(
            merge_decision(&status(Mergeable::Mergeable, CheckState::None)),
            Reject("checks:NONE".into())
        );
        let mut closed = status(Mergeable::Mergeable, CheckState::Success);
        closed.state = ItemState::Closed;
        assert_eq!(merge_decision(&closed), Reject("state:closed".into()));
    }

    #[test]
    fn linked_issue_resolution() {
        let mut pr = pull_request(200, &[], ItemState::Open, false);
        assert_eq!(linked_issue(&pr), 200);

        pr.body = "Some change.\n\nCloses #42".into();
        assert_eq!(linked_issue(&pr), 42);

        pr.body = "fixes: #7 and resolves #8".into();
        assert_eq!(linked_issue(&pr), 7);

        pr.head_ref = "osoba/#83".into();
        assert_eq!(linked_issue(&pr), 83);

        pr.head_ref = "feature/#83-x".into();
        pr.body = "mentions #9 only".into();
        assert_eq!(linked_issue(&pr), 200);
    }
}
