//! The two poll loops and the orchestrator that runs them.
//!
//! Each loop runs on its own thread and owns its watcher outright, so the
//! health counters are plain fields. The only things shared across threads
//! are the read-only config, the providers and the [`Shutdown`] token.

pub mod health;
pub mod issue;
pub mod pr;
pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::github::GitHubClient;
use crate::shutdown::Shutdown;

use health::{AutoMergeMetrics, HealthSnapshot, HealthStats, HealthStatus};
use issue::IssueWatcher;
use pr::PrWatcher;

pub trait Watcher: Send {
    /// Short name used in spans and thread names.
    fn name(&self) -> &'static str;

    /// One synchronous pass. Never fails; errors are counted in the stats.
    fn tick(&mut self, shutdown: &Shutdown);

    fn stats(&self) -> &HealthStats;

    /// Merge counters, for watchers that merge.
    fn auto_merge(&self) -> Option<&AutoMergeMetrics> {
        None
    }

    fn check_health(&self, now: DateTime<Utc>, stale_after: Duration, min_success_rate: f64) -> HealthStatus {
        self.stats().check_health(now, stale_after, min_success_rate)
    }
}

/// Tick `watcher` every `interval` until shutdown.
///
/// After each tick the health check is logged and, when `health_dir` is set,
/// written there as a [`HealthSnapshot`].
pub fn run_loop(
    watcher: &mut dyn Watcher,
    shutdown: &Shutdown,
    interval: Duration,
    config: &Config,
    health_dir: Option<&Path>,
) {
    let mut tick: u64 = 0;
    let mut last: Option<HealthStatus> = None;
    while !shutdown.is_triggered() {
        tick += 1;
        {
            let _span = tracing::info_span!("tick", watcher = watcher.name(), tick).entered();
            watcher.tick(shutdown);
            let now = Utc::now();
            let status = watcher.check_health(now, config.stale_after(), config.health.min_success_rate);
            log_health(watcher.stats(), &status, last.as_ref());
            if let Some(dir) = health_dir {
                let snapshot = HealthSnapshot {
                    watcher: watcher.name().to_string(),
                    updated_at: now,
                    stats: watcher.stats().clone(),
                    health: status.clone(),
                    auto_merge: watcher.auto_merge().cloned(),
                };
                if let Err(e) = snapshot.write(dir) {
                    tracing::warn!(error = %format!("{e:#}"), "could not write health snapshot");
                }
            }
            last = Some(status);
        }
        if shutdown.wait(interval) {
            break;
        }
    }
    tracing::info!(watcher = watcher.name(), ticks = tick, "watcher stopped");
}

/// True when `current` should be reported at warn level: it is unhealthy
/// and differs in kind from what was last reported.
fn is_new_problem(current: &HealthStatus, last: Option<&HealthStatus>) -> bool {
    if current.healthy {
        return false;
    }
    let kinds = |s: &HealthStatus| {
        s.reasons
            .iter()
            .map(std::mem::discriminant)
            .collect::<Vec<_>>()
    };
    last.is_none_or(|last| kinds(last) != kinds(current))
}

fn log_health(stats: &HealthStats, status: &HealthStatus, last: Option<&HealthStatus>) {
    let reasons: Vec<String> = status.reasons.iter().map(ToString::to_string).collect();
    if is_new_problem(status, last) {
        tracing::warn!(
            total = stats.total_executions,
            failed = stats.failed_executions,
            reasons = %reasons.join("; "),
            "unhealthy"
        );
    } else if status.healthy && last.is_some_and(|last| !last.healthy) {
        tracing::info!(total = stats.total_executions, "healthy again");
    } else {
        tracing::debug!(
            healthy = status.healthy,
            total = stats.total_executions,
            succeeded = stats.successful_executions,
            failed = stats.failed_executions,
            reasons = %reasons.join("; "),
            "health"
        );
    }
}

/// Runs the issue and PR watchers side by side until shutdown.
pub struct Orchestrator {
    config: Arc<Config>,
    client: Arc<dyn GitHubClient>,
    dispatcher: Arc<dyn Dispatcher>,
    health_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, client: Arc<dyn GitHubClient>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            config,
            client,
            dispatcher,
            health_dir: None,
        }
    }

    /// Write per-watcher health snapshots into `dir` after every tick.
    #[must_use]
    pub fn with_health_dir(mut self, dir: PathBuf) -> Self {
        self.health_dir = Some(dir);
        self
    }

    /// Block until `shutdown` fires and both loops have unwound.
    pub fn run(self, shutdown: &Shutdown) -> anyhow::Result<()> {
        let interval = self.config.poll_interval();
        let issue = IssueWatcher::new(&self.config, self.client.clone(), self.dispatcher.clone());
        let pr = PrWatcher::new(&self.config, self.client.clone(), self.dispatcher.clone());
        tracing::info!(interval_secs = interval.as_secs(), "watchers starting");

        let handles = [
            spawn(Box::new(issue), shutdown.clone(), interval, self.config.clone(), self.health_dir.clone())?,
            spawn(Box::new(pr), shutdown.clone(), interval, self.config.clone(), self.health_dir.clone())?,
        ];

        let mut panicked = Vec::new();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("watcher").to_string();
            if handle.join().is_err() {
                // Take the other loop down too rather than run half an orchestrator.
                shutdown.trigger();
                panicked.push(name);
            }
        }
        if panicked.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("watcher thread panicked: {}", panicked.join(", "))
        }
    }
}

fn spawn(
    mut watcher: Box<dyn Watcher>,
    shutdown: Shutdown,
    interval: Duration,
    config: Arc<Config>,
    health_dir: Option<PathBuf>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let name = format!("{}-watcher", watcher.name());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_loop(watcher.as_mut(), &shutdown, interval, &config, health_dir.as_deref()))
        .map_err(|e| anyhow::anyhow!("spawning {name}: {e}"))
}
