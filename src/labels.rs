//! Status label vocabulary and the static transition table.
//!
//! Every watched item carries at most one authoritative `status:*` label.
//! Trigger labels are advanced by the transition engine; in-progress labels
//! are owned by whoever claimed the item and are never advanced here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Prefix every status label carries on GitHub.
pub const STATUS_PREFIX: &str = "status:";

/// One token of the ordered status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseLabel {
    NeedsPlan,
    Planning,
    Ready,
    Implementing,
    ReviewRequested,
    Reviewing,
    Lgtm,
    RequiresChanges,
    Revising,
}

impl PhaseLabel {
    /// All labels in vocabulary order.
    pub const ALL: [PhaseLabel; 9] = [
        PhaseLabel::NeedsPlan,
        PhaseLabel::Planning,
        PhaseLabel::Ready,
        PhaseLabel::Implementing,
        PhaseLabel::ReviewRequested,
        PhaseLabel::Reviewing,
        PhaseLabel::Lgtm,
        PhaseLabel::RequiresChanges,
        PhaseLabel::Revising,
    ];

    pub const fn token(self) -> &'static str {
        match self {
            PhaseLabel::NeedsPlan => "needs-plan",
            PhaseLabel::Planning => "planning",
            PhaseLabel::Ready => "ready",
            PhaseLabel::Implementing => "implementing",
            PhaseLabel::ReviewRequested => "review-requested",
            PhaseLabel::Reviewing => "reviewing",
            PhaseLabel::Lgtm => "lgtm",
            PhaseLabel::RequiresChanges => "requires-changes",
            PhaseLabel::Revising => "revising",
        }
    }

    /// The label as it appears on GitHub, e.g. `status:needs-plan`.
    pub fn label(self) -> String {
        format!("{STATUS_PREFIX}{}", self.token())
    }

    /// Parse a GitHub label. Only the `status:` form is recognized.
    pub fn from_label(label: &str) -> Option<Self> {
        label
            .strip_prefix(STATUS_PREFIX)
            .and_then(|token| token.parse().ok())
    }

    /// Legal next label and the phase it authorizes, if this label is a trigger.
    pub const fn next(self) -> Option<(PhaseLabel, Phase)> {
        match self {
            PhaseLabel::NeedsPlan => Some((PhaseLabel::Planning, Phase::Plan)),
            PhaseLabel::Ready => Some((PhaseLabel::Implementing, Phase::Implement)),
            PhaseLabel::ReviewRequested => Some((PhaseLabel::Reviewing, Phase::Review)),
            PhaseLabel::RequiresChanges => Some((PhaseLabel::Revising, Phase::Revise)),
            PhaseLabel::Planning
            | PhaseLabel::Implementing
            | PhaseLabel::Reviewing
            | PhaseLabel::Revising
            | PhaseLabel::Lgtm => None,
        }
    }

    pub const fn is_trigger(self) -> bool {
        self.next().is_some()
    }

    pub const fn is_in_progress(self) -> bool {
        matches!(
            self,
            PhaseLabel::Planning
                | PhaseLabel::Implementing
                | PhaseLabel::Reviewing
                | PhaseLabel::Revising
        )
    }

    /// Label color used when creating the label on GitHub.
    pub const fn color(self) -> &'static str {
        match self {
            PhaseLabel::NeedsPlan | PhaseLabel::Ready | PhaseLabel::ReviewRequested => "0e8a16",
            PhaseLabel::Planning
            | PhaseLabel::Implementing
            | PhaseLabel::Reviewing
            | PhaseLabel::Revising => "fbca04",
            PhaseLabel::Lgtm => "1d76db",
            PhaseLabel::RequiresChanges => "d93f0b",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            PhaseLabel::NeedsPlan => "Waiting for an implementation plan",
            PhaseLabel::Planning => "Plan is being written",
            PhaseLabel::Ready => "Plan approved, ready to implement",
            PhaseLabel::Implementing => "Implementation in progress",
            PhaseLabel::ReviewRequested => "Waiting for review",
            PhaseLabel::Reviewing => "Review in progress",
            PhaseLabel::Lgtm => "Approved, ready to merge",
            PhaseLabel::RequiresChanges => "Review requested changes",
            PhaseLabel::Revising => "Addressing review feedback",
        }
    }
}

impl fmt::Display for PhaseLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for PhaseLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PhaseLabel::ALL
            .into_iter()
            .find(|l| l.token() == s)
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status label: {0}")]
pub struct UnknownLabel(pub String);

/// Pick the authoritative status label from an item's label set.
///
/// When more than one status label is present (a half-finished transition),
/// an in-progress label wins so the item is left alone.
pub fn status_of<S: AsRef<str>>(labels: &[S]) -> Option<PhaseLabel> {
    let mut found: Vec<PhaseLabel> = labels
        .iter()
        .filter_map(|l| PhaseLabel::from_label(l.as_ref()))
        .collect();
    if found.iter().any(|l| l.is_in_progress()) {
        found.retain(|l| l.is_in_progress());
    }
    found.sort();
    found.into_iter().next()
}

/// Trigger label of a claim that added its in-progress label but never
/// removed the trigger, e.g. `needs-plan` next to `planning`.
pub fn interrupted_claim<S: AsRef<str>>(labels: &[S]) -> Option<PhaseLabel> {
    let found: Vec<PhaseLabel> = labels
        .iter()
        .filter_map(|l| PhaseLabel::from_label(l.as_ref()))
        .collect();
    found
        .iter()
        .copied()
        .filter(|l| l.next().is_some_and(|(to, _)| found.contains(&to)))
        .min()
}

/// One step of the development loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Plan,
    Implement,
    Review,
    Revise,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Plan, Phase::Implement, Phase::Review, Phase::Revise];

    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Review => "review",
            Phase::Revise => "revise",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown phase: {s}"))
    }
}
