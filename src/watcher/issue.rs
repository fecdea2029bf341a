//! Issue watcher: claims issues carrying a trigger label and dispatches the
//! phase the new label authorizes.

use std::sync::Arc;

use chrono::Utc;

use super::Watcher;
use super::health::HealthStats;
use super::retry::{RetryPolicy, with_retry};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::github::{GitHubClient, Issue, WatchedItem};
use crate::labels::{self, PhaseLabel};
use crate::shutdown::Shutdown;
use crate::transition::TransitionEngine;

/// What one tick did. Logged at the end of the tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub listed: usize,
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct IssueWatcher {
    client: Arc<dyn GitHubClient>,
    engine: TransitionEngine,
    dispatcher: Arc<dyn Dispatcher>,
    labels: Vec<String>,
    auto_plan: bool,
    retry: RetryPolicy,
    stats: HealthStats,
}

impl IssueWatcher {
    pub fn new(config: &Config, client: Arc<dyn GitHubClient>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            engine: TransitionEngine::new(client.clone(), config.github.phase_comments),
            client,
            dispatcher,
            labels: config.github.issue_labels.clone(),
            auto_plan: config.github.auto_plan_issue,
            retry: RetryPolicy::from_config(&config.retry),
            stats: HealthStats::new(Utc::now()),
        }
    }

    /// One poll: list, claim, dispatch. Errors are counted, never returned.
    pub fn poll(&mut self, shutdown: &Shutdown) -> TickSummary {
        let mut summary = TickSummary::default();
        let issues = match with_retry(&self.retry, shutdown, "list issues", || {
            self.client.list_issues_by_labels(&self.labels)
        }) {
            Ok(issues) => issues,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "listing issues failed");
                self.stats.record_failure(Utc::now());
                summary.failed += 1;
                return summary;
            }
        };
        summary.listed = issues.len();

        for issue in issues {
            if shutdown.is_triggered() {
                break;
            }
            self.process(issue, &mut summary);
        }

        if self.auto_plan && !shutdown.is_triggered() {
            self.auto_plan(shutdown);
        }
        summary
    }

    fn process(&mut self, issue: Issue, summary: &mut TickSummary) {
        let number = issue.number;
        let title = issue.title.clone();
        let item = WatchedItem::Issue(issue);
        let result = match self.engine.claim_and_advance(&item) {
            Ok(Some(result)) if result.claimed => result,
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(issue = number, error = %format!("{e:#}"), "claim failed");
                self.stats.record_failure(Utc::now());
                summary.failed += 1;
                return;
            }
        };
        summary.claimed += 1;

        match self.dispatcher.dispatch(number, result.phase, &title) {
            Ok(dispatched) => {
                tracing::info!(
                    issue = number,
                    phase = %result.phase,
                    window = %dispatched.environment.window_name,
                    launched = dispatched.launched,
                    "dispatched"
                );
                self.stats.record_success(Utc::now());
                summary.dispatched += 1;
            }
            Err(e) => {
                tracing::error!(issue = number, phase = %result.phase, error = %format!("{e:#}"), "dispatch failed");
                self.stats.record_failure(Utc::now());
                summary.failed += 1;
            }
        }
    }

    /// Label the oldest unlabeled open issue `status:needs-plan` when nothing
    /// else is queued or in flight.
    fn auto_plan(&self, shutdown: &Shutdown) {
        let open = match with_retry(&self.retry, shutdown, "list open issues", || {
            self.client.list_open_issues()
        }) {
            Ok(open) => open,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "auto-plan: listing open issues failed");
                return;
            }
        };
        let Some(number) = auto_plan_candidate(&open) else {
            return;
        };
        let label = PhaseLabel::NeedsPlan.label();
        match self.client.add_label(number, &label) {
            Ok(()) => tracing::info!(issue = number, "auto-plan: queued for planning"),
            Err(e) => tracing::warn!(issue = number, error = %format!("{e:#}"), "auto-plan: labeling failed"),
        }
    }
}

/// Lowest-numbered open issue without a status label, provided no open issue
/// is queued or in progress.
pub fn auto_plan_candidate(open: &[Issue]) -> Option<u64> {
    let busy = open.iter().any(|i| {
        labels::status_of(&i.labels).is_some_and(|l| l.is_in_progress() || l.is_trigger())
    });
    if busy {
        return None;
    }
    open.iter()
        .filter(|i| labels::status_of(&i.labels).is_none())
        .map(|i| i.number)
        .min()
}

impl Watcher for IssueWatcher {
    fn name(&self) -> &'static str {
        "issue"
    }

    fn tick(&mut self, shutdown: &Shutdown) {
        let summary = self.poll(shutdown);
        tracing::debug!(
            listed = summary.listed,
            claimed = summary.claimed,
            dispatched = summary.dispatched,
            failed = summary.failed,
            "issue tick done"
        );
    }

    fn stats(&self) -> &HealthStats {
        &self.stats
    }
}
