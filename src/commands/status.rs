use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;

use super::{OutputFormat, RepoArgs};
use crate::daemon::DaemonState;
use crate::github::{GitHubClient, RateLimit};
use crate::tmux::{self, TerminalManager};
use crate::watcher::health::HealthSnapshot;

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[command(flatten)]
    pub repo: RepoArgs,
    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<OutputFormat>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub repo: String,
    pub daemon: DaemonSummary,
    pub session: SessionSummary,
    /// Last health report of each watcher; empty while the daemon is stopped.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub watchers: Vec<HealthSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Serialize)]
pub struct DaemonSummary {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<i64>,
    /// Pid of a dead record that was cleaned up by this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_pid: Option<u32>,
    pub log_file: String,
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    pub name: String,
    pub exists: bool,
    pub windows: Vec<WindowSummary>,
}

#[derive(Debug, Serialize)]
pub struct WindowSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl StatusArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let format = OutputFormat::resolve(self.format);
        let ctx = self.repo.resolve()?;
        let supervisor = ctx.supervisor()?;

        let now = Utc::now();
        let daemon = match supervisor.status()? {
            DaemonState::Running(record) => DaemonSummary {
                running: true,
                pid: Some(record.pid),
                started_at: Some(record.start_time),
                uptime_secs: Some(record.uptime(now).num_seconds()),
                stale_pid: None,
                log_file: supervisor.log_file().display().to_string(),
            },
            DaemonState::Stopped { stale } => DaemonSummary {
                running: false,
                pid: None,
                started_at: None,
                uptime_secs: None,
                stale_pid: stale.map(|r| r.pid),
                log_file: supervisor.log_file().display().to_string(),
            },
        };

        let watchers = if daemon.running {
            HealthSnapshot::read_all(supervisor.health_dir()).unwrap_or_else(|e| {
                tracing::debug!(error = %format!("{e:#}"), "health snapshots unavailable");
                Vec::new()
            })
        } else {
            Vec::new()
        };

        let session_name = ctx.session();
        let terminal = ctx.terminal();
        let exists = terminal.session_exists(&session_name).unwrap_or(false);
        let windows = if exists {
            terminal
                .list_windows(&session_name)
                .unwrap_or_default()
                .into_iter()
                .map(|name| {
                    let parsed = tmux::parse_window_name(&name);
                    WindowSummary {
                        issue: parsed.map(|(n, _)| n),
                        phase: parsed.map(|(_, p)| p.to_string()),
                        name,
                    }
                })
                .collect()
        } else {
            Vec::new()
        };

        let rate_limit = match ctx.github() {
            Ok(client) => client
                .get_rate_limit()
                .inspect_err(|e| tracing::debug!(error = %format!("{e:#}"), "rate limit unavailable"))
                .ok(),
            Err(_) => None,
        };

        let report = StatusReport {
            repo: ctx
                .remote
                .as_ref()
                .map_or_else(|| ctx.root.display().to_string(), ToString::to_string),
            daemon,
            session: SessionSummary {
                name: session_name,
                exists,
                windows,
            },
            watchers,
            rate_limit,
        };

        match format {
            OutputFormat::Pretty => print_pretty(&report),
            OutputFormat::Text => print_text(&report),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        }
        Ok(())
    }
}

fn format_duration(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s if s < 86400 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d {}h", s / 86400, (s % 86400) / 3600),
    }
}

/// One line per watcher: counters, then either "healthy" or the reasons.
fn health_line(snapshot: &HealthSnapshot, now: DateTime<Utc>) -> String {
    let stats = &snapshot.stats;
    let verdict = if snapshot.health.healthy {
        "healthy".to_string()
    } else {
        let reasons: Vec<String> = snapshot.health.reasons.iter().map(ToString::to_string).collect();
        format!("UNHEALTHY: {}", reasons.join("; "))
    };
    let mut line = format!(
        "{:<6} {verdict} ({} ok, {} failed, checked {} ago)",
        snapshot.watcher,
        stats.successful_executions,
        stats.failed_executions,
        format_duration((now - snapshot.updated_at).num_seconds().max(0))
    );
    if let Some(ref merges) = snapshot.auto_merge {
        line.push_str(&format!(
            "; merges {}/{}",
            merges.successful_merges, merges.total_attempts
        ));
    }
    line
}

fn print_pretty(report: &StatusReport) {
    println!("=== osoba: {} ===\n", report.repo);
    let d = &report.daemon;
    if d.running {
        println!(
            "Daemon:   running (pid {}, up {})",
            d.pid.unwrap_or_default(),
            format_duration(d.uptime_secs.unwrap_or_default())
        );
    } else {
        println!("Daemon:   stopped");
        if let Some(pid) = d.stale_pid {
            println!("          removed stale record for pid {pid}");
        }
    }
    println!("Log:      {}", d.log_file);

    let s = &report.session;
    if s.exists {
        println!("Session:  {} ({} windows)", s.name, s.windows.len());
        for w in &s.windows {
            match (&w.issue, &w.phase) {
                (Some(issue), Some(phase)) => println!("  - {:<16} #{issue} {phase}", w.name),
                _ => println!("  - {}", w.name),
            }
        }
    } else {
        println!("Session:  {} (not running)", s.name);
    }

    if !report.watchers.is_empty() {
        println!("\nWatchers:");
        let now = Utc::now();
        for snapshot in &report.watchers {
            println!("  - {}", health_line(snapshot, now));
        }
    }

    if let Some(ref rl) = report.rate_limit {
        println!(
            "\nGitHub:   {}/{} requests left, resets {}",
            rl.remaining,
            rl.limit,
            rl.reset_at.format("%H:%M:%S UTC")
        );
    }
}

fn print_text(report: &StatusReport) {
    let d = &report.daemon;
    println!("repo {}", report.repo);
    match (d.running, d.pid) {
        (true, Some(pid)) => println!("daemon running pid={pid} uptime={}s", d.uptime_secs.unwrap_or_default()),
        _ => println!("daemon stopped"),
    }
    println!(
        "session {} {}",
        report.session.name,
        if report.session.exists { "up" } else { "down" }
    );
    for w in &report.session.windows {
        println!("window {}", w.name);
    }
    for snapshot in &report.watchers {
        println!(
            "watcher {} {} total={} failed={}",
            snapshot.watcher,
            if snapshot.health.healthy { "healthy" } else { "unhealthy" },
            snapshot.stats.total_executions,
            snapshot.stats.failed_executions
        );
    }
    if let Some(ref rl) = report.rate_limit {
        println!("ratelimit {}/{} reset={}", rl.remaining, rl.limit, rl.reset_at.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::watcher::health::{AutoMergeMetrics, HealthStats};

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3 * 3600 + 120), "3h 2m");
        assert_eq!(format_duration(2 * 86400 + 3600), "2d 1h");
    }

    #[test]
    fn json_report_omits_absent_fields() {
        let report = StatusReport {
            repo: "douhashi/osoba".into(),
            daemon: DaemonSummary {
                running: false,
                pid: None,
                started_at: None,
                uptime_secs: None,
                stale_pid: None,
                log_file: "/tmp/osoba.log".into(),
            },
            session: SessionSummary {
                name: "osoba-osoba".into(),
                exists: false,
                windows: vec![],
            },
            watchers: vec![],
            rate_limit: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["daemon"]["running"], false);
        assert!(json["daemon"].get("pid").is_none());
        assert!(json.get("rate_limit").is_none());
        assert!(json.get("watchers").is_none());
    }

    #[test]
    fn health_line_shows_reasons_and_merges() {
        let now = Utc::now();
        let stats = HealthStats::new(now);
        let mut merges = AutoMergeMetrics::default();
        merges.record_success();
        merges.record_failure("checks:FAILURE");
        let snapshot = HealthSnapshot {
            watcher: "pr".into(),
            updated_at: now - chrono::TimeDelta::seconds(5),
            health: stats.check_health(now, Duration::from_secs(300), 0.5),
            stats,
            auto_merge: Some(merges),
        };

        let line = health_line(&snapshot, now);
        assert!(line.starts_with("pr     UNHEALTHY: no executions yet"), "{line}");
        assert!(line.contains("checked 5s ago"), "{line}");
        assert!(line.ends_with("merges 1/2"), "{line}");
    }
}
