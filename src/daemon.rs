//! Daemon supervisor: one background osoba per repository.
//!
//! The only durable state is a small record file at
//! `{state_dir}/pids/{repo_id}.pid` holding the pid, start time and
//! repository path. A record whose pid is dead is stale; `status` deletes it.
//! Watcher health snapshots live beside it in `{state_dir}/health/{repo_id}/`.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ExitError;
use crate::github::RepoRef;

/// Set in the environment of the detached child.
pub const CHILD_ENV: &str = "OSOBA_DAEMON_CHILD";

/// Overrides the state directory.
pub const STATE_DIR_ENV: &str = "OSOBA_STATE_DIR";

const START_GRACE: Duration = Duration::from_millis(300);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonRecord {
    pub pid: u32,
    pub start_time: DateTime<Utc>,
    pub repo_path: PathBuf,
}

impl DaemonRecord {
    pub fn new(pid: u32, repo_path: &Path) -> Self {
        Self {
            pid,
            start_time: Utc::now(),
            repo_path: repo_path.to_path_buf(),
        }
    }

    /// `pid\nRFC3339\nrepo_path\n`
    pub fn to_file_string(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.pid,
            self.start_time.to_rfc3339(),
            self.repo_path.display()
        )
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let mut lines = contents.lines();
        let pid = lines
            .next()
            .context("empty daemon record")?
            .trim()
            .parse()
            .context("bad pid in daemon record")?;
        let start_time = DateTime::parse_from_rfc3339(
            lines.next().context("daemon record has no start time")?.trim(),
        )
        .context("bad start time in daemon record")?
        .to_utc();
        let repo_path = PathBuf::from(lines.next().context("daemon record has no repo path")?);
        Ok(Self {
            pid,
            start_time,
            repo_path,
        })
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.start_time
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonState {
    Running(DaemonRecord),
    /// `stale` is set when a dead record was found and removed.
    Stopped { stale: Option<DaemonRecord> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32, forced: bool },
    AlreadyStopped,
}

/// `$OSOBA_STATE_DIR`, else the platform data directory.
pub fn state_dir() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os(STATE_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
        .ok_or_else(|| ExitError::Other("cannot determine a state directory; set OSOBA_STATE_DIR".into()))?;
    Ok(base.join("osoba"))
}

/// Key for the record file: `owner-name` when the remote is known, else a
/// hash of the canonical repository path.
pub fn repo_id(repo_root: &Path, repo: Option<&RepoRef>) -> String {
    if let Some(repo) = repo {
        return repo.slug();
    }
    let canonical = repo_root
        .canonicalize()
        .unwrap_or_else(|_| repo_root.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

pub fn is_daemon_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some_and(|v| v == "1")
}

fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// Signal 0 checks liveness. Any error counts as dead.
pub fn process_alive(pid: u32) -> bool {
    let Some(pid) = to_pid_t(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send `signal`. Returns false if the process was already gone.
fn send_signal(pid: u32, signal: libc::c_int) -> anyhow::Result<bool> {
    let Some(raw) = to_pid_t(pid) else {
        return Ok(false);
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(raw, signal) } == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(err).with_context(|| format!("sending signal {signal} to pid {pid}"))
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now().checked_add(timeout);
    while deadline.is_none_or(|deadline| Instant::now() < deadline) {
        if !process_alive(pid) {
            return true;
        }
        std::thread::sleep(STOP_POLL);
    }
    !process_alive(pid)
}

/// Owns the record file for one repository.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pid_file: PathBuf,
    log_file: PathBuf,
    health_dir: PathBuf,
}

impl Supervisor {
    pub fn new(state_dir: &Path, repo_id: &str) -> Self {
        Self {
            pid_file: state_dir.join("pids").join(format!("{repo_id}.pid")),
            log_file: state_dir.join("logs").join(format!("{repo_id}.log")),
            health_dir: state_dir.join("health").join(repo_id),
        }
    }

    pub fn for_repo(repo_root: &Path, repo: Option<&RepoRef>) -> anyhow::Result<Self> {
        Ok(Self::new(&state_dir()?, &repo_id(repo_root, repo)))
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Where the running daemon's watchers write their health snapshots.
    pub fn health_dir(&self) -> &Path {
        &self.health_dir
    }

    pub fn read_record(&self) -> anyhow::Result<Option<DaemonRecord>> {
        match fs::read_to_string(&self.pid_file) {
            Ok(contents) => DaemonRecord::parse(&contents)
                .with_context(|| format!("reading {}", self.pid_file.display()))
                .map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.pid_file.display())),
        }
    }

    pub fn write_record(&self, record: &DaemonRecord) -> anyhow::Result<()> {
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.pid_file)
            .with_context(|| format!("writing {}", self.pid_file.display()))?;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(record.to_file_string().as_bytes())?;
        Ok(())
    }

    pub fn remove_record(&self) -> anyhow::Result<()> {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.pid_file.display())),
        }
    }

    /// True only if a record exists and its pid is alive. A stale record is
    /// removed on the way.
    pub fn is_running(&self) -> bool {
        matches!(self.status(), Ok(DaemonState::Running(_)))
    }

    /// Current state. Stale and unreadable records are removed.
    pub fn status(&self) -> anyhow::Result<DaemonState> {
        let record = match self.read_record() {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "discarding unreadable daemon record");
                self.remove_record()?;
                return Ok(DaemonState::Stopped { stale: None });
            }
        };
        match record {
            Some(record) if process_alive(record.pid) => Ok(DaemonState::Running(record)),
            Some(record) => {
                tracing::info!(pid = record.pid, "removing stale daemon record");
                self.remove_record()?;
                Ok(DaemonState::Stopped {
                    stale: Some(record),
                })
            }
            None => Ok(DaemonState::Stopped { stale: None }),
        }
    }

    /// Refuse if another live process holds the record.
    fn ensure_not_running(&self, own_pid: Option<u32>) -> anyhow::Result<()> {
        if let DaemonState::Running(record) = self.status()?
            && Some(record.pid) != own_pid
        {
            return Err(ExitError::AlreadyRunning { pid: record.pid }.into());
        }
        Ok(())
    }

    /// Detach a copy of this executable running `args` in the background.
    /// Returns the child's pid.
    pub fn start(&self, repo_root: &Path, args: &[OsString]) -> anyhow::Result<u32> {
        self.ensure_not_running(None)?;

        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("opening {}", self.log_file.display()))?;
        let exe = std::env::current_exe().context("locating the osoba executable")?;

        let mut command = Command::new(exe);
        command
            .args(args)
            .current_dir(repo_root)
            .env(CHILD_ENV, "1")
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0);
        if std::env::var_os("OSOBA_LOG_FORMAT").is_none() {
            command.env("OSOBA_LOG_FORMAT", "json");
        }
        let mut child = command.spawn().context("spawning daemon process")?;
        let pid = child.id();
        self.write_record(&DaemonRecord::new(pid, repo_root))?;

        std::thread::sleep(START_GRACE);
        if let Some(status) = child.try_wait()? {
            self.remove_record()?;
            return Err(ExitError::Other(format!(
                "daemon exited immediately ({status}); see {}",
                self.log_file.display()
            ))
            .into());
        }
        tracing::info!(pid, log = %self.log_file.display(), "daemon started");
        Ok(pid)
    }

    /// Record this process as the running daemon. The record is removed when
    /// the guard drops, provided it still names this process.
    pub fn claim_current(&self, repo_root: &Path) -> anyhow::Result<RecordGuard> {
        let pid = std::process::id();
        self.ensure_not_running(Some(pid))?;
        self.write_record(&DaemonRecord::new(pid, repo_root))?;
        Ok(RecordGuard {
            supervisor: self.clone(),
            pid,
        })
    }

    /// SIGTERM, wait up to `timeout`, then SIGKILL.
    pub fn stop(&self, timeout: Duration) -> anyhow::Result<StopOutcome> {
        let Some(record) = self.read_record().ok().flatten() else {
            self.remove_record()?;
            return Ok(StopOutcome::AlreadyStopped);
        };
        let pid = record.pid;
        if !process_alive(pid) || !send_signal(pid, libc::SIGTERM)? {
            self.remove_record()?;
            return Ok(StopOutcome::AlreadyStopped);
        }
        tracing::info!(pid, "sent SIGTERM");

        let mut forced = false;
        if !wait_for_exit(pid, timeout) {
            tracing::warn!(pid, timeout_secs = timeout.as_secs(), "daemon did not exit, sending SIGKILL");
            send_signal(pid, libc::SIGKILL)?;
            forced = true;
            if !wait_for_exit(pid, Duration::from_secs(2)) {
                return Err(ExitError::Other(format!("pid {pid} survived SIGKILL")).into());
            }
        }
        self.remove_record()?;
        Ok(StopOutcome::Stopped { pid, forced })
    }
}

/// Removes the record on drop if it still belongs to `pid`.
#[derive(Debug)]
pub struct RecordGuard {
    supervisor: Supervisor,
    pid: u32,
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if let Ok(Some(record)) = self.supervisor.read_record()
            && record.pid == self.pid
            && let Err(e) = self.supervisor.remove_record()
        {
            tracing::warn!(error = %format!("{e:#}"), "could not remove daemon record");
        }
    }
}
