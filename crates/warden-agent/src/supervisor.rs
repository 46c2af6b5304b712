use std::collections::HashMap;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const KILL_SETTLE: Duration = Duration::from_millis(250);

pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// How a child is asked to shut down before the unconditional kill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopPolicy {
    /// Send `signal` to the child's process group, wait up to `grace`.
    Signal { signal: i32, grace: Duration },
    /// Write `line` to the child's stdin, wait up to `grace`.
    Stdin { line: String, grace: Duration },
}

impl Default for StopPolicy {
    fn default() -> Self {
        StopPolicy::Signal {
            signal: libc::SIGTERM,
            grace: DEFAULT_GRACE,
        }
    }
}

impl StopPolicy {
    pub fn grace(&self) -> Duration {
        match self {
            StopPolicy::Signal { grace, .. } | StopPolicy::Stdin { grace, .. } => *grace,
        }
    }
}

/// Fully resolved launch invocation for one instance. Derived on every
/// start; never stored.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    /// `KEY=value` assignments layered over the agent's own environment.
    pub env: Vec<String>,
    pub stop: StopPolicy,
}

/// Observable snapshot of one supervised process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub name: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
}

impl ProcessState {
    fn absent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("unknown server: {0}")]
    Unknown(String),
    #[error("{name} already running (pid={pid})")]
    AlreadyRunning { name: String, pid: u32 },
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("open log {}: {source}", .path.display())]
    OpenLog {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("spawn {name}: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

struct ProcessRecord {
    state: ProcessState,
    stop: StopPolicy,
    stdin: Option<ChildStdin>,
    pgid: i32,
}

/// Supervises the child processes of one agent.
///
/// A single mutex guards the records map and every record's state. It is
/// released across all external waits in `stop` (signal delivery, grace
/// polling); the reaper task takes it only for the terminal write.
#[derive(Clone, Default)]
pub struct Supervisor {
    records: Arc<Mutex<HashMap<String, ProcessRecord>>>,
}

fn decode_exit(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the spec's command in a fresh process group with stdout/stderr
    /// appended to `log_path`. Fails synchronously on a running duplicate,
    /// an unopenable log file, or a spawn error.
    pub async fn start(
        &self,
        spec: LaunchSpec,
        log_path: &Path,
    ) -> Result<ProcessState, SupervisorError> {
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(&spec.name) {
            if existing.state.running {
                return Err(SupervisorError::AlreadyRunning {
                    name: spec.name.clone(),
                    pid: existing.state.pid.unwrap_or_default(),
                });
            }
        }

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(log_path)
            .map_err(|source| SupervisorError::OpenLog {
                path: log_path.to_path_buf(),
                source,
            })?;
        let log_for_stderr = log_file
            .try_clone()
            .map_err(|source| SupervisorError::OpenLog {
                path: log_path.to_path_buf(),
                source,
            })?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_for_stderr));
        if !spec.cwd.is_empty() {
            cmd.current_dir(&spec.cwd);
        }
        for assignment in &spec.env {
            if let Some((key, value)) = assignment.split_once('=') {
                cmd.env(key, value);
            }
        }

        // New process group led by the child, so stop can signal the whole
        // tree via kill(-pid).
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        let stdin = child.stdin.take();

        let state = ProcessState {
            name: spec.name.clone(),
            running: true,
            pid: Some(pid),
            started_at: Some(Utc::now()),
            ..ProcessState::default()
        };
        records.insert(
            spec.name.clone(),
            ProcessRecord {
                state: state.clone(),
                stop: spec.stop,
                stdin,
                pgid: pid as i32,
            },
        );
        drop(records);

        // Reaper: sole writer of terminal state.
        let records = self.records.clone();
        let name = spec.name.clone();
        tokio::spawn(async move {
            let waited = child.wait().await;

            let mut records = records.lock().await;
            let Some(record) = records.get_mut(&name) else {
                return;
            };
            if record.state.pid != Some(pid) {
                // A fresh start replaced the record.
                return;
            }

            record.state.running = false;
            record.state.exited_at = Some(Utc::now());
            match waited {
                Ok(status) => {
                    record.state.exit_code = Some(decode_exit(status));
                    if !status.success() {
                        record.state.last_error = status.to_string();
                    }
                }
                Err(err) => {
                    record.state.exit_code = Some(1);
                    record.state.last_error = format!("wait failed: {err}");
                }
            }
            record.stdin = None;
            tracing::info!(
                name = %name,
                exit_code = record.state.exit_code,
                "process exited"
            );
        });

        Ok(state)
    }

    /// Graceful stop per the record's policy, then SIGKILL to the process
    /// group at the grace deadline. The terminal state transition belongs
    /// to the reaper; this returns whatever state it observes.
    pub async fn stop(&self, name: &str) -> Result<ProcessState, SupervisorError> {
        let (policy, pgid, stdin) = {
            let mut records = self.records.lock().await;
            let record = records
                .get_mut(name)
                .ok_or_else(|| SupervisorError::Unknown(name.to_string()))?;
            if !record.state.running {
                return Err(SupervisorError::NotRunning(name.to_string()));
            }
            let stdin = match record.stop {
                StopPolicy::Stdin { .. } => record.stdin.take(),
                StopPolicy::Signal { .. } => None,
            };
            (record.stop.clone(), record.pgid, stdin)
        };

        // Graceful attempt. Delivery errors are ignored: the child may have
        // exited between the snapshot and here.
        match &policy {
            StopPolicy::Stdin { line, .. } => {
                if let Some(mut stdin) = stdin {
                    let _ = stdin.write_all(line.as_bytes()).await;
                    let _ = stdin.flush().await;
                }
            }
            StopPolicy::Signal { signal, .. } => unsafe {
                libc::kill(-pgid, *signal);
            },
        }

        let deadline = tokio::time::Instant::now() + policy.grace();
        while tokio::time::Instant::now() < deadline {
            if !self.is_running(name).await {
                return Ok(self.status(name).await);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
        tokio::time::sleep(KILL_SETTLE).await;

        Ok(self.status(name).await)
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let records = self.records.lock().await;
        records.get(name).is_some_and(|r| r.state.running)
    }

    /// Current snapshot; a name without a record reports not running.
    pub async fn status(&self, name: &str) -> ProcessState {
        let records = self.records.lock().await;
        match records.get(name) {
            Some(record) => record.state.clone(),
            None => ProcessState::absent(name),
        }
    }

    pub async fn list(&self) -> Vec<ProcessState> {
        let records = self.records.lock().await;
        records.values().map(|r| r.state.clone()).collect()
    }
}
