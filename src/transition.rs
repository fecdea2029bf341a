//! Label transition engine.
//!
//! A claim replaces an item's trigger label with its in-progress label. Only
//! the process whose transition lands gets to dispatch; everyone else sees
//! `claimed == false` and moves on.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use crate::github::{GitHubClient, WatchedItem};
use crate::labels::{self, Phase, PhaseLabel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionResult {
    pub claimed: bool,
    pub from: PhaseLabel,
    pub to: PhaseLabel,
    /// Phase authorized by the new label.
    pub phase: Phase,
}

/// Transition the engine would attempt for `item`, without touching GitHub.
/// An interrupted claim (trigger and target both present) is planned again.
pub fn planned(item: &WatchedItem) -> Option<(PhaseLabel, PhaseLabel, Phase)> {
    let from = labels::interrupted_claim(item.labels()).or_else(|| item.status_label())?;
    let (to, phase) = from.next()?;
    Some((from, to, phase))
}

pub struct TransitionEngine {
    client: Arc<dyn GitHubClient>,
    phase_comments: bool,
}

impl TransitionEngine {
    pub fn new(client: Arc<dyn GitHubClient>, phase_comments: bool) -> Self {
        Self {
            client,
            phase_comments,
        }
    }

    /// Claim `item` and advance its label one step.
    ///
    /// `Ok(None)` means the item is not actionable (no status label, or one
    /// the table never advances) and GitHub was not called. `claimed: false`
    /// means the live labels no longer matched what this tick observed.
    pub fn claim_and_advance(&self, item: &WatchedItem) -> anyhow::Result<Option<TransitionResult>> {
        let Some((from, to, phase)) = planned(item) else {
            return Ok(None);
        };
        let number = item.number();
        let claimed = if item.labels().iter().any(|l| *l == to.label()) {
            self.finish_interrupted(number, from, to)?
        } else {
            self.client
                .transition_label(number, &from.label(), &to.label())
                .with_context(|| format!("transitioning #{number} from {from} to {to}"))?
        };

        if claimed {
            tracing::info!(kind = item.kind(), number, %from, %to, "claimed");
            if self.phase_comments {
                self.comment(number, phase);
            }
        } else {
            tracing::debug!(kind = item.kind(), number, %from, %to, "already claimed elsewhere");
        }

        Ok(Some(TransitionResult {
            claimed,
            from,
            to,
            phase,
        }))
    }

    /// A previous claim added `to` but failed to remove `from`. Removing the
    /// trigger completes it; the item is then ours to dispatch.
    fn finish_interrupted(&self, number: u64, from: PhaseLabel, to: PhaseLabel) -> anyhow::Result<bool> {
        tracing::warn!(number, %from, %to, "finishing interrupted claim");
        self.client
            .remove_label(number, &from.label())
            .with_context(|| format!("finishing claim of #{number}: removing {from}"))?;
        Ok(true)
    }

    fn comment(&self, number: u64, phase: Phase) {
        let body = format!("osoba: starting **{phase}** phase for #{number}.");
        if let Err(e) = self.client.create_issue_comment(number, &body) {
            tracing::warn!(number, %phase, error = %format!("{e:#}"), "could not post phase comment");
        }
    }
}
