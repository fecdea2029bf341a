//! Per-watcher execution counters and the health check built on them.
//!
//! Each watcher owns its own [`HealthStats`]; nothing here is shared between
//! threads. After every tick the loop writes a [`HealthSnapshot`] to
//! `{state_dir}/health/{repo_id}/{watcher}.json` so `osoba status` can show it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub last_execution_time: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnhealthyReason {
    NeverExecuted,
    Stale { idle_secs: i64, threshold_secs: u64 },
    LowSuccessRate { rate: f64, floor: f64 },
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhealthyReason::NeverExecuted => f.write_str("no executions yet"),
            UnhealthyReason::Stale {
                idle_secs,
                threshold_secs,
            } => write!(f, "last execution {idle_secs}s ago (threshold {threshold_secs}s)"),
            UnhealthyReason::LowSuccessRate { rate, floor } => {
                write!(f, "success rate {:.0}% below {:.0}%", rate * 100.0, floor * 100.0)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub reasons: Vec<UnhealthyReason>,
}

impl HealthStats {
    pub const fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            total_executions: 0,
            successful_executions: 0,
            failed_executions: 0,
            last_execution_time: None,
            start_time,
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.total_executions += 1;
        self.successful_executions += 1;
        self.last_execution_time = Some(at);
    }

    pub fn record_failure(&mut self, at: DateTime<Utc>) {
        self.total_executions += 1;
        self.failed_executions += 1;
        self.last_execution_time = Some(at);
    }

    /// `None` before the first execution.
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        (self.total_executions > 0)
            .then(|| self.successful_executions as f64 / self.total_executions as f64)
    }

    pub fn check_health(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        min_success_rate: f64,
    ) -> HealthStatus {
        let mut reasons = Vec::new();
        match self.last_execution_time {
            None => reasons.push(UnhealthyReason::NeverExecuted),
            Some(last) => {
                let idle = now - last;
                if idle.to_std().is_ok_and(|idle| idle > stale_after) {
                    reasons.push(UnhealthyReason::Stale {
                        idle_secs: idle.num_seconds(),
                        threshold_secs: stale_after.as_secs(),
                    });
                }
            }
        }
        if let Some(rate) = self.success_rate()
            && rate < min_success_rate
        {
            reasons.push(UnhealthyReason::LowSuccessRate {
                rate,
                floor: min_success_rate,
            });
        }
        HealthStatus {
            healthy: reasons.is_empty(),
            reasons,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMergeMetrics {
    pub total_attempts: u64,
    pub successful_merges: u64,
    pub failed_merges: u64,
    pub failure_reasons: BTreeMap<String, u64>,
}

impl AutoMergeMetrics {
    pub fn record_success(&mut self) {
        self.total_attempts += 1;
        self.successful_merges += 1;
    }

    pub fn record_failure(&mut self, reason: &str) {
        self.total_attempts += 1;
        self.failed_merges += 1;
        *self.failure_reasons.entry(reason.to_string()).or_default() += 1;
    }
}

/// What one watcher last reported about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub watcher: String,
    pub updated_at: DateTime<Utc>,
    pub stats: HealthStats,
    pub health: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<AutoMergeMetrics>,
}

impl HealthSnapshot {
    /// Replace `{dir}/{watcher}.json`. Readers never see a partial file.
    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.watcher));
        let tmp = dir.join(format!(".{}.json.tmp", self.watcher));
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("writing {}", path.display()))
    }

    /// Every snapshot in `dir`, sorted by watcher name. A missing directory is empty.
    pub fn read_all(dir: &Path) -> anyhow::Result<Vec<Self>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", dir.display())),
        };
        let mut snapshots = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let contents = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            match serde_json::from_str::<Self>(&contents) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping unreadable health snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.watcher.cmp(&b.watcher));
        Ok(snapshots)
    }

    /// Drop every snapshot in `dir`.
    pub fn clear(dir: &Path) -> anyhow::Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    const STALE: Duration = Duration::from_secs(300);

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T12:00:00Z").unwrap().to_utc()
    }

    #[test]
    fn never_executed_is_unhealthy() {
        let stats = HealthStats::new(t0());
        let status = stats.check_health(t0(), STALE, 0.5);
        assert!(!status.healthy);
        assert_eq!(status.reasons, vec![UnhealthyReason::NeverExecuted]);
    }

    #[test]
    fn stale_is_unhealthy_only_past_threshold() {
        let mut stats = HealthStats::new(t0());
        stats.record_success(t0());
        assert!(stats.check_health(t0() + TimeDelta::seconds(300), STALE, 0.5).healthy);

        let status = stats.check_health(t0() + TimeDelta::seconds(301), STALE, 0.5);
        assert!(!status.healthy);
        assert!(matches!(status.reasons[..], [UnhealthyReason::Stale { idle_secs: 301, .. }]));
    }

    #[test]
    fn low_success_rate_is_unhealthy() {
        let mut stats = HealthStats::new(t0());
        stats.record_success(t0());
        stats.record_failure(t0());
        stats.record_failure(t0());
        let status = stats.check_health(t0(), STALE, 0.5);
        assert!(!status.healthy);
        assert!(matches!(status.reasons[..], [UnhealthyReason::LowSuccessRate { .. }]));

        stats.record_success(t0());
        assert!(stats.check_health(t0(), STALE, 0.5).healthy);
    }

    #[test]
    fn counters_add_up() {
        let mut stats = HealthStats::new(t0());
        stats.record_success(t0());
        stats.record_failure(t0() + TimeDelta::seconds(5));
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.successful_executions + stats.failed_executions, stats.total_executions);
        assert_eq!(stats.last_execution_time, Some(t0() + TimeDelta::seconds(5)));
        assert_eq!(stats.success_rate(), Some(0.5));
    }

    #[test]
    fn merge_failures_are_bucketed_by_reason() {
        let mut metrics = AutoMergeMetrics::default();
        metrics.record_success();
        metrics.record_failure("mergeable:CONFLICTING");
        metrics.record_failure("mergeable:CONFLICTING");
        metrics.record_failure("checks:FAILURE");
        assert_eq!(metrics.total_attempts, 4);
        assert_eq!(metrics.successful_merges, 1);
        assert_eq!(metrics.failed_merges, 3);
        assert_eq!(metrics.failure_reasons["mergeable:CONFLICTING"], 2);
        assert_eq!(metrics.failure_reasons["checks:FAILURE"], 1);
    }

    #[test]
    fn snapshots_are_written_and_read_back_by_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let health_dir = dir.path().join("health").join("repo");
        let stats = HealthStats::new(t0());
        let mut metrics = AutoMergeMetrics::default();
        metrics.record_failure("checks:FAILURE");

        for (watcher, auto_merge) in [("pr", Some(metrics.clone())), ("issue", None)] {
            HealthSnapshot {
                watcher: watcher.to_string(),
                updated_at: t0(),
                stats: stats.clone(),
                health: stats.check_health(t0(), STALE, 0.5),
                auto_merge,
            }
            .write(&health_dir)
            .unwrap();
        }
        fs::write(health_dir.join("notes.txt"), "ignored").unwrap();

        let read = HealthSnapshot::read_all(&health_dir).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].watcher, "issue");
        assert_eq!(read[0].health.reasons, vec![UnhealthyReason::NeverExecuted]);
        assert_eq!(read[1].auto_merge, Some(metrics));

        HealthSnapshot::clear(&health_dir).unwrap();
        assert!(HealthSnapshot::read_all(&health_dir).unwrap().is_empty());
    }
}
