//! Process creation, signalling and death watch.
//!
//! [`CommandSpawner`] launches applications with `tokio::process`, optionally
//! behind a sandbox wrapper, and parks a task on each child that posts
//! [`BrokerEvent::ChildExited`] when it dies. Signals and priority changes go
//! through detached `kill` and `renice` commands (safe, no FFI).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::BrokerEvent;
use crate::error::LaunchError;
use crate::ids::ProcessId;

/// Declared application runtime, selecting the sandbox profile.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    /// Hosted by the shared web runtime.
    #[default]
    Web,
    /// Self-contained native binary; subject to the headroom admission check.
    Native,
    /// Background service without a visible card.
    Service,
}

impl std::fmt::Display for AppType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Native => write!(f, "native"),
            Self::Service => write!(f, "service"),
        }
    }
}

impl std::str::FromStr for AppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "web" => Ok(Self::Web),
            "native" => Ok(Self::Native),
            "service" => Ok(Self::Service),
            other => Err(format!("unknown app type: {other}")),
        }
    }
}

/// Wrapper program and arguments placed in front of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxProfile {
    /// Wrapper executable; `None` runs the application directly.
    pub wrapper: Option<PathBuf>,
    /// Arguments passed to the wrapper before the application path.
    pub args: Vec<String>,
}

/// Sandbox profiles keyed by [`AppType`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub web: SandboxProfile,
    pub native: SandboxProfile,
    pub service: SandboxProfile,
}

impl SandboxConfig {
    #[must_use]
    pub fn profile(&self, app_type: AppType) -> &SandboxProfile {
        match app_type {
            AppType::Web => &self.web,
            AppType::Native => &self.native,
            AppType::Service => &self.service,
        }
    }
}

/// Everything needed to start one application process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub app_id: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub sandbox: SandboxProfile,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl SpawnRequest {
    /// Program and argv after applying the sandbox wrapper.
    #[must_use]
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        match &self.sandbox.wrapper {
            Some(wrapper) => {
                let mut argv = self.sandbox.args.clone();
                argv.push(self.program.display().to_string());
                argv.extend(self.args.iter().cloned());
                (wrapper.clone(), argv)
            }
            None => (self.program.clone(), self.args.clone()),
        }
    }
}

/// OS process operations used by the supervisor.
pub trait ProcessSpawner: Send {
    /// Start a process. Failures are reported once and never retried.
    fn spawn(&mut self, request: &SpawnRequest) -> Result<ProcessId, LaunchError>;
    /// Send the terminate signal. Returns `false` if the signal failed.
    fn terminate(&mut self, pid: ProcessId) -> bool;
    /// Change scheduling priority.
    fn renice(&mut self, pid: ProcessId, nice: i32) -> bool;
}

// =============================================================================
// CommandSpawner
// =============================================================================

/// Real spawner backed by `tokio::process`. Must be used inside a runtime.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl CommandSpawner {
    /// Child deaths are posted to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self { events }
    }
}

impl ProcessSpawner for CommandSpawner {
    fn spawn(&mut self, request: &SpawnRequest) -> Result<ProcessId, LaunchError> {
        let (program, argv) = request.command_line();
        if let Some(wrapper) = &request.sandbox.wrapper {
            if !wrapper.exists() {
                return Err(LaunchError::SandboxSetup {
                    app_id: request.app_id.clone(),
                    reason: format!("wrapper {} does not exist", wrapper.display()),
                });
            }
        }

        let mut child = tokio::process::Command::new(&program)
            .args(&argv)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    LaunchError::ExecutableNotFound {
                        app_id: request.app_id.clone(),
                        path: program.clone(),
                    }
                } else {
                    LaunchError::SpawnFailed {
                        app_id: request.app_id.clone(),
                        reason: err.to_string(),
                    }
                }
            })?;

        let pid = child.id().map(ProcessId).ok_or_else(|| LaunchError::SpawnFailed {
            app_id: request.app_id.clone(),
            reason: "process exited before its pid was read".to_string(),
        })?;
        info!(%pid, app_id = %request.app_id, program = %program.display(), "application spawned");

        let events = self.events.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(%pid, error = %err, "waiting on child failed");
                    None
                }
            };
            debug!(%pid, ?code, "child exited");
            let _ = events.send(BrokerEvent::ChildExited { pid, code });
        });

        Ok(pid)
    }

    fn terminate(&mut self, pid: ProcessId) -> bool {
        run_detached("kill", vec!["-TERM".into(), pid.to_string()], pid, true)
    }

    fn renice(&mut self, pid: ProcessId, nice: i32) -> bool {
        run_detached(
            "renice",
            vec!["-n".into(), nice.to_string(), "-p".into(), pid.to_string()],
            pid,
            false,
        )
    }
}

/// Start a helper command without waiting for it. Its exit is checked on a
/// separate task so the event loop never blocks on it. Returns `false` only
/// when the command could not be started.
fn run_detached(program: &'static str, args: Vec<String>, pid: ProcessId, loud: bool) -> bool {
    let child = tokio::process::Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(err) => {
            warn!(%pid, program, error = %err, "failed to start helper command");
            return false;
        }
    };
    tokio::spawn(async move {
        let failure = match child.wait_with_output().await {
            Ok(output) if output.status.success() => return,
            Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
            Err(err) => err.to_string(),
        };
        // Already gone; the death watch will clean up.
        if failure.contains("No such process") {
            return;
        }
        if loud {
            warn!(%pid, program, error = %failure, "helper command failed");
        } else {
            debug!(%pid, program, error = %failure, "helper command failed");
        }
    });
    true
}

// =============================================================================
// RecordingSpawner
// =============================================================================

/// What a [`RecordingSpawner`] was asked to do.
#[derive(Debug, Default)]
pub struct SpawnLog {
    pub spawned: Vec<(ProcessId, SpawnRequest)>,
    pub terminated: Vec<ProcessId>,
    pub reniced: Vec<(ProcessId, i32)>,
    /// Fail the next spawn with this reason.
    pub fail_next: Option<String>,
    next_pid: u32,
}

/// In-memory spawner handing out fake pids; used by embedders without a
/// process model and by tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingSpawner {
    log: Arc<Mutex<SpawnLog>>,
}

impl RecordingSpawner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of everything recorded so far.
    #[must_use]
    pub fn log(&self) -> Arc<Mutex<SpawnLog>> {
        Arc::clone(&self.log)
    }

    #[must_use]
    pub fn terminated(&self) -> Vec<ProcessId> {
        self.log.lock().terminated.clone()
    }

    pub fn fail_next(&self, reason: impl Into<String>) {
        self.log.lock().fail_next = Some(reason.into());
    }
}

impl ProcessSpawner for RecordingSpawner {
    fn spawn(&mut self, request: &SpawnRequest) -> Result<ProcessId, LaunchError> {
        let mut log = self.log.lock();
        if let Some(reason) = log.fail_next.take() {
            return Err(LaunchError::SpawnFailed {
                app_id: request.app_id.clone(),
                reason,
            });
        }
        log.next_pid += 1;
        let pid = ProcessId(1000 + log.next_pid);
        log.spawned.push((pid, request.clone()));
        Ok(pid)
    }

    fn terminate(&mut self, pid: ProcessId) -> bool {
        self.log.lock().terminated.push(pid);
        true
    }

    fn renice(&mut self, pid: ProcessId, nice: i32) -> bool {
        self.log.lock().reniced.push((pid, nice));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(wrapper: Option<&str>) -> SpawnRequest {
        SpawnRequest {
            app_id: "com.example.mail".into(),
            program: PathBuf::from("/apps/mail/bin/mail"),
            args: vec!["--card".into()],
            sandbox: SandboxProfile {
                wrapper: wrapper.map(PathBuf::from),
                args: vec!["--profile".into(), "native".into()],
            },
            working_dir: PathBuf::from("/apps/mail"),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn command_line_without_wrapper() {
        let (program, argv) = request(None).command_line();
        assert_eq!(program, PathBuf::from("/apps/mail/bin/mail"));
        assert_eq!(argv, vec!["--card"]);
    }

    #[test]
    fn command_line_with_wrapper() {
        let (program, argv) = request(Some("/usr/bin/jail")).command_line();
        assert_eq!(program, PathBuf::from("/usr/bin/jail"));
        assert_eq!(
            argv,
            vec!["--profile", "native", "/apps/mail/bin/mail", "--card"]
        );
    }

    #[test]
    fn app_type_parse_and_display() {
        assert_eq!("Native".parse::<AppType>(), Ok(AppType::Native));
        assert!("java".parse::<AppType>().is_err());
        assert_eq!(AppType::Service.to_string(), "service");
    }

    #[test]
    fn recording_spawner_hands_out_pids() {
        let mut spawner = RecordingSpawner::new();
        let a = spawner.spawn(&request(None)).unwrap();
        let b = spawner.spawn(&request(None)).unwrap();
        assert_ne!(a, b);
        spawner.fail_next("no slots");
        assert!(matches!(
            spawner.spawn(&request(None)),
            Err(LaunchError::SpawnFailed { .. })
        ));
        assert!(spawner.terminate(a));
        assert_eq!(spawner.terminated(), vec![a]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_spawner_reports_child_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spawner = CommandSpawner::new(tx);
        let req = SpawnRequest {
            app_id: "true".into(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exit 3".into()],
            sandbox: SandboxProfile::default(),
            working_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
        };
        let pid = spawner.spawn(&req).expect("spawn sh");
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("event");
        match event {
            BrokerEvent::ChildExited { pid: exited, code } => {
                assert_eq!(exited, pid);
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_signals_without_waiting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut spawner = CommandSpawner::new(tx);
        let req = SpawnRequest {
            app_id: "sleeper".into(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exec sleep 30".into()],
            sandbox: SandboxProfile::default(),
            working_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
        };
        let pid = spawner.spawn(&req).expect("spawn sh");
        assert!(spawner.terminate(pid));
        assert!(spawner.renice(pid, 10));

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout")
            .expect("event");
        match event {
            BrokerEvent::ChildExited { pid: exited, code } => {
                assert_eq!(exited, pid);
                assert_eq!(code, None, "killed by a signal");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_spawner_missing_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut spawner = CommandSpawner::new(tx);
        let req = SpawnRequest {
            app_id: "ghost".into(),
            program: dir.path().join("does-not-exist"),
            args: Vec::new(),
            sandbox: SandboxProfile::default(),
            working_dir: dir.path().to_path_buf(),
            env: BTreeMap::new(),
        };
        assert!(matches!(
            spawner.spawn(&req),
            Err(LaunchError::ExecutableNotFound { .. })
        ));
    }
}
