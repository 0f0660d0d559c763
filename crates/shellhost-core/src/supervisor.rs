//! Application process supervision.
//!
//! The supervisor owns the process table, resolves app ids to pids, applies
//! scheduling priority and runs the debounced nuke queue. Every repeated
//! "last window closed" signal for a process within the debounce window
//! collapses into a single terminate call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AdmissionDenied, Error, Result};
use crate::ids::{ConnectionId, ProcessId};
use crate::memory_pressure::MemoryPressureGovernor;
use crate::spawn::{AppType, ProcessSpawner, SandboxConfig, SpawnRequest};

/// Library search path variable set for every launched application.
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// Process supervision configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum concurrently running applications.
    pub max_processes: usize,
    /// Rolling delay before queued nukes fire.
    pub nuke_debounce_ms: u64,
    /// Extra directories appended to the library search path.
    pub library_paths: Vec<PathBuf>,
    /// Nice value for processes without a focused window.
    pub background_nice: i32,
    /// Nice value for the focused process.
    pub active_nice: i32,
    /// Sandbox wrappers per app type.
    pub sandbox: SandboxConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_processes: 16,
            nuke_debounce_ms: 2_000,
            library_paths: Vec::new(),
            background_nice: 10,
            active_nice: 0,
            sandbox: SandboxConfig::default(),
        }
    }
}

/// Scheduling priority of a supervised process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Active,
    #[default]
    Background,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// One supervised application process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedProcess {
    pub pid: ProcessId,
    pub app_id: String,
    pub app_type: AppType,
    /// Set once the process connects.
    pub connection: Option<ConnectionId>,
    pub priority: Priority,
    pub launched_at_ms: u64,
    pub quota_mb: Option<u64>,
}

/// A request to start an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub app_id: String,
    pub path: PathBuf,
    pub args: Vec<String>,
    pub app_type: AppType,
    pub required_memory_mb: u64,
    /// Memory quota; falls back to the governor's default.
    pub quota_mb: Option<u64>,
}

impl LaunchRequest {
    #[must_use]
    pub fn new(app_id: impl Into<String>, path: impl Into<PathBuf>, app_type: AppType) -> Self {
        Self {
            app_id: app_id.into(),
            path: path.into(),
            args: Vec::new(),
            app_type,
            required_memory_mb: 0,
            quota_mb: None,
        }
    }

    #[must_use]
    pub fn with_memory(mut self, required_memory_mb: u64, quota_mb: Option<u64>) -> Self {
        self.required_memory_mb = required_memory_mb;
        self.quota_mb = quota_mb;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Spawned(ProcessId),
    /// The app was already running; its window should come to the front.
    BroughtToFront(ProcessId),
}

impl LaunchOutcome {
    #[must_use]
    pub fn pid(self) -> ProcessId {
        match self {
            Self::Spawned(pid) | Self::BroughtToFront(pid) => pid,
        }
    }
}

/// Process table, app index and nuke queue.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    spawner: Box<dyn ProcessSpawner>,
    processes: BTreeMap<ProcessId, ManagedProcess>,
    by_app: HashMap<String, ProcessId>,
    nuke_set: BTreeSet<ProcessId>,
    nuke_deadline: Option<u64>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("processes", &self.processes.len())
            .field("nuke_set", &self.nuke_set)
            .field("nuke_deadline", &self.nuke_deadline)
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig, spawner: Box<dyn ProcessSpawner>) -> Self {
        Self {
            config,
            spawner,
            processes: BTreeMap::new(),
            by_app: HashMap::new(),
            nuke_set: BTreeSet::new(),
            nuke_deadline: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    #[must_use]
    pub fn get(&self, pid: ProcessId) -> Option<&ManagedProcess> {
        self.processes.get(&pid)
    }

    #[must_use]
    pub fn by_app_id(&self, app_id: &str) -> Option<&ManagedProcess> {
        self.by_app.get(app_id).and_then(|pid| self.processes.get(pid))
    }

    pub fn processes(&self) -> impl Iterator<Item = &ManagedProcess> {
        self.processes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Start an application, or point at its existing process.
    pub fn launch(
        &mut self,
        request: &LaunchRequest,
        governor: &mut MemoryPressureGovernor,
        now_ms: u64,
    ) -> Result<LaunchOutcome> {
        governor.admit_launch(request.required_memory_mb, request.app_type)?;

        if let Some(&pid) = self.by_app.get(&request.app_id) {
            if self.nuke_set.contains(&pid) {
                return Err(AdmissionDenied::ShuttingDown {
                    app_id: request.app_id.clone(),
                }
                .into());
            }
            debug!(%pid, app_id = %request.app_id, "already running; bringing to front");
            return Ok(LaunchOutcome::BroughtToFront(pid));
        }

        if self.processes.len() >= self.config.max_processes {
            return Err(AdmissionDenied::TooManyProcesses {
                limit: self.config.max_processes,
            }
            .into());
        }

        let spawn = self.build_spawn_request(request)?;
        let pid = self.spawner.spawn(&spawn)?;

        let quota_mb = request.quota_mb.or(governor.config().default_quota_mb);
        if let Some(quota) = quota_mb {
            governor.track(pid, quota);
        }

        info!(%pid, app_id = %request.app_id, app_type = %request.app_type, ?quota_mb, "application launched");
        self.processes.insert(
            pid,
            ManagedProcess {
                pid,
                app_id: request.app_id.clone(),
                app_type: request.app_type,
                connection: None,
                priority: Priority::Background,
                launched_at_ms: now_ms,
                quota_mb,
            },
        );
        self.by_app.insert(request.app_id.clone(), pid);
        Ok(LaunchOutcome::Spawned(pid))
    }

    fn build_spawn_request(&self, request: &LaunchRequest) -> Result<SpawnRequest> {
        let app_dir = request
            .path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let search_path = std::iter::once(app_dir.clone()).chain(self.config.library_paths.iter().cloned());
        let joined = std::env::join_paths(search_path)
            .map_err(|err| Error::Runtime(format!("invalid library path: {err}")))?;

        let mut env = BTreeMap::new();
        env.insert(
            LIBRARY_PATH_VAR.to_string(),
            joined.to_string_lossy().into_owned(),
        );

        Ok(SpawnRequest {
            app_id: request.app_id.clone(),
            program: request.path.clone(),
            args: request.args.clone(),
            sandbox: self.config.sandbox.profile(request.app_type).clone(),
            working_dir: app_dir,
            env,
        })
    }

    /// Record the connection a process opened.
    pub fn bind_connection(&mut self, pid: ProcessId, connection: ConnectionId) -> bool {
        match self.processes.get_mut(&pid) {
            Some(process) => {
                process.connection = Some(connection);
                true
            }
            None => false,
        }
    }

    /// Terminate `pid` and drop its bookkeeping immediately.
    pub fn kill(&mut self, pid: ProcessId) -> Option<ManagedProcess> {
        let process = self.forget(pid)?;
        if !self.spawner.terminate(pid) {
            warn!(%pid, app_id = %process.app_id, "terminate signal failed");
        }
        info!(%pid, app_id = %process.app_id, "process killed");
        Some(process)
    }

    /// Death-watch callback. Idempotent.
    pub fn child_exited(&mut self, pid: ProcessId) -> Option<ManagedProcess> {
        let process = self.forget(pid);
        if let Some(process) = &process {
            debug!(%pid, app_id = %process.app_id, "supervised process exited");
        }
        process
    }

    fn forget(&mut self, pid: ProcessId) -> Option<ManagedProcess> {
        self.nuke_set.remove(&pid);
        if self.nuke_set.is_empty() {
            self.nuke_deadline = None;
        }
        let process = self.processes.remove(&pid)?;
        if self.by_app.get(&process.app_id) == Some(&pid) {
            self.by_app.remove(&process.app_id);
        }
        Some(process)
    }

    /// Queue `pid` for a delayed kill, pushing the shared deadline out.
    pub fn add_to_nuke_list(&mut self, pid: ProcessId, now_ms: u64) -> bool {
        if !self.processes.contains_key(&pid) {
            return false;
        }
        self.nuke_set.insert(pid);
        let deadline = now_ms.saturating_add(self.config.nuke_debounce_ms);
        self.nuke_deadline = Some(deadline);
        debug!(%pid, deadline, pending = self.nuke_set.len(), "nuke queued");
        true
    }

    /// The armed nuke deadline, if any.
    #[must_use]
    pub fn nuke_deadline(&self) -> Option<u64> {
        self.nuke_deadline
    }

    #[must_use]
    pub fn is_nuke_pending(&self, pid: ProcessId) -> bool {
        self.nuke_set.contains(&pid)
    }

    /// Kill every queued pid once the deadline has passed.
    pub fn fire_nukes(&mut self, now_ms: u64) -> Vec<ManagedProcess> {
        match self.nuke_deadline {
            Some(deadline) if deadline <= now_ms => {}
            _ => return Vec::new(),
        }
        let pending = std::mem::take(&mut self.nuke_set);
        self.nuke_deadline = None;
        pending.into_iter().filter_map(|pid| self.kill(pid)).collect()
    }

    /// Apply a scheduling priority. Returns `false` when nothing changed.
    pub fn set_priority(&mut self, pid: ProcessId, priority: Priority) -> bool {
        let Some(process) = self.processes.get_mut(&pid) else {
            return false;
        };
        if process.priority == priority {
            return false;
        }
        process.priority = priority;
        let nice = match priority {
            Priority::Active => self.config.active_nice,
            Priority::Background => self.config.background_nice,
        };
        self.spawner.renice(pid, nice);
        debug!(%pid, %priority, nice, "priority changed");
        true
    }

    /// Pids of every supervised process.
    #[must_use]
    pub fn pids(&self) -> Vec<ProcessId> {
        self.processes.keys().copied().collect()
    }
}
