//! Memory pressure governor: system state machine, per-process quotas and
//! launch admission.
//!
//! Two inputs drive the state:
//!
//! - threshold crossings reported asynchronously by the system
//!   ([`MemoryPressureGovernor::on_threshold_crossing`]), and
//! - periodic self-sampling of the broker's own RSS
//!   ([`MemoryPressureGovernor::tick`]).
//!
//! The effective [`MemoryState`] is the more severe of the two. The governor
//! never reaches into other components; it returns [`GovernorAction`]s that
//! the broker context applies (kill, flush, reap, trim, notify).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AdmissionDenied;
use crate::ids::ProcessId;
use crate::spawn::AppType;

// =============================================================================
// Pressure states
// =============================================================================

/// System memory pressure state, ordered by severity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryState {
    /// Plenty of memory.
    #[default]
    Normal,
    /// Getting tight; trim allocator caches.
    Medium,
    /// Flush cached instances and refuse launches.
    Low,
    /// As Low, and quota violators are terminated.
    Critical,
}

impl std::fmt::Display for MemoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl MemoryState {
    /// Numeric value for gauge metrics (0-3).
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Medium => 1,
            Self::Low => 2,
            Self::Critical => 3,
        }
    }
}

/// Corrective action requested by the governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GovernorAction {
    /// Terminate a process that repeatedly exceeded its quota under pressure.
    Kill {
        pid: ProcessId,
        rss_mb: u64,
        quota_mb: u64,
    },
    /// Return freed buffer memory to the system.
    TrimAllocator,
    /// Destroy every parked instance.
    FlushCache,
    /// Tear down kept-alive headless instances.
    ReapKeptAlive,
    /// Tell observers the state changed.
    StateChanged { state: MemoryState },
}

// =============================================================================
// Configuration
// =============================================================================

/// Memory governor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Enable periodic sampling.
    pub enabled: bool,
    /// Sample interval in milliseconds.
    pub sample_interval_ms: u64,
    /// Broker RSS (MB) at which self-sampling reports Medium.
    pub self_medium_mb: u64,
    /// Broker RSS (MB) at which self-sampling reports Low.
    pub self_low_mb: u64,
    /// Broker RSS (MB) at which self-sampling reports Critical.
    pub self_critical_mb: u64,
    /// Quota applied to launches that do not declare one.
    pub default_quota_mb: Option<u64>,
    /// Violations tolerated before a process becomes a kill candidate.
    pub violation_threshold: u32,
    /// System "normal" crossing (percentage of RAM used).
    pub normal_used_percent: f64,
    /// System "low" crossing.
    pub low_used_percent: f64,
    /// System "critical" crossing.
    pub critical_used_percent: f64,
    /// System "reboot" crossing.
    pub reboot_used_percent: f64,
    /// Fixed threshold table; when unset the table is derived from meminfo.
    pub static_thresholds: Option<ThresholdTable>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: 5_000,
            self_medium_mb: 256,
            self_low_mb: 384,
            self_critical_mb: 512,
            default_quota_mb: None,
            violation_threshold: 1,
            normal_used_percent: 70.0,
            low_used_percent: 85.0,
            critical_used_percent: 95.0,
            reboot_used_percent: 98.0,
            static_thresholds: None,
        }
    }
}

impl MemoryConfig {
    /// Classify the broker's own RSS.
    #[must_use]
    pub fn classify_self(&self, rss_mb: u64) -> MemoryState {
        if rss_mb >= self.self_critical_mb {
            MemoryState::Critical
        } else if rss_mb >= self.self_low_mb {
            MemoryState::Low
        } else if rss_mb >= self.self_medium_mb {
            MemoryState::Medium
        } else {
            MemoryState::Normal
        }
    }
}

// =============================================================================
// Threshold table
// =============================================================================

/// One named crossing: its limit and how far away it still is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdLevel {
    /// Committed memory (MB) at which the crossing happens.
    pub limit_mb: u64,
    /// Remaining headroom (MB) before the crossing.
    pub remaining_mb: u64,
}

/// Named crossings exposed by the system telemetry source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdTable {
    pub normal: ThresholdLevel,
    pub low: ThresholdLevel,
    pub critical: ThresholdLevel,
    pub reboot: ThresholdLevel,
}

impl ThresholdTable {
    /// Build a table from committed/total memory and percentage crossings.
    #[must_use]
    pub fn from_usage(used_mb: u64, total_mb: u64, config: &MemoryConfig) -> Self {
        let level = |percent: f64| {
            let limit_mb = ((total_mb as f64) * percent / 100.0) as u64;
            ThresholdLevel {
                limit_mb,
                remaining_mb: limit_mb.saturating_sub(used_mb),
            }
        };
        Self {
            normal: level(config.normal_used_percent),
            low: level(config.low_used_percent),
            critical: level(config.critical_used_percent),
            reboot: level(config.reboot_used_percent),
        }
    }

    /// State implied by which crossings have been passed.
    #[must_use]
    pub fn classify(&self) -> MemoryState {
        if self.critical.remaining_mb == 0 {
            MemoryState::Critical
        } else if self.low.remaining_mb == 0 {
            MemoryState::Low
        } else if self.normal.remaining_mb == 0 {
            MemoryState::Medium
        } else {
            MemoryState::Normal
        }
    }
}

/// Pluggable source of the system threshold table.
pub trait ThresholdSource: Send {
    fn thresholds(&self) -> ThresholdTable;
}

/// Threshold table set by the embedder (or a test) rather than read from the OS.
#[derive(Debug, Clone, Default)]
pub struct StaticThresholds {
    table: Arc<Mutex<ThresholdTable>>,
}

impl StaticThresholds {
    #[must_use]
    pub fn new(table: ThresholdTable) -> Self {
        Self {
            table: Arc::new(Mutex::new(table)),
        }
    }

    /// Replace the table; clones of this handle observe the change.
    pub fn set(&self, table: ThresholdTable) {
        *self.table.lock() = table;
    }
}

impl ThresholdSource for StaticThresholds {
    fn thresholds(&self) -> ThresholdTable {
        *self.table.lock()
    }
}

// =============================================================================
// Telemetry
// =============================================================================

/// Resident-set-size telemetry for tracked processes and the broker itself.
pub trait MemoryTelemetry: Send {
    /// RSS of `pid` in KB, or `None` if the process no longer exists.
    fn process_rss_kb(&self, pid: ProcessId) -> Option<u64>;
    /// RSS of the broker process in KB.
    fn self_rss_kb(&self) -> Option<u64>;
}

/// Telemetry fed by an external sampler.
///
/// Cloned handles share state, so the embedder keeps one handle to push
/// samples while the governor owns another.
#[derive(Debug, Clone, Default)]
pub struct PushedTelemetry {
    inner: Arc<Mutex<PushedSamples>>,
}

#[derive(Debug, Default)]
struct PushedSamples {
    processes: BTreeMap<ProcessId, u64>,
    self_rss_kb: Option<u64>,
}

impl PushedTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_process_mb(&self, pid: ProcessId, rss_mb: u64) {
        self.inner.lock().processes.insert(pid, rss_mb * 1024);
    }

    pub fn remove_process(&self, pid: ProcessId) {
        self.inner.lock().processes.remove(&pid);
    }

    pub fn set_self_mb(&self, rss_mb: u64) {
        self.inner.lock().self_rss_kb = Some(rss_mb * 1024);
    }
}

impl MemoryTelemetry for PushedTelemetry {
    fn process_rss_kb(&self, pid: ProcessId) -> Option<u64> {
        self.inner.lock().processes.get(&pid).copied()
    }

    fn self_rss_kb(&self) -> Option<u64> {
        self.inner.lock().self_rss_kb
    }
}

// =============================================================================
// Quota table
// =============================================================================

/// Quota bookkeeping for one tracked process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessMemoryWatch {
    pub pid: ProcessId,
    pub max_memory_allowed_mb: u64,
    pub violation_count: u32,
    /// Last sampled RSS in MB (0 until the first sample).
    pub last_rss_mb: u64,
}

impl ProcessMemoryWatch {
    /// Quota not yet consumed, given the last sample.
    #[must_use]
    pub fn slack_mb(&self) -> u64 {
        self.max_memory_allowed_mb.saturating_sub(self.last_rss_mb)
    }
}

// =============================================================================
// Governor
// =============================================================================

/// Memory pressure governor. Owned exclusively by the broker context.
pub struct MemoryPressureGovernor {
    config: MemoryConfig,
    system_state: MemoryState,
    self_state: MemoryState,
    state: MemoryState,
    watches: BTreeMap<ProcessId, ProcessMemoryWatch>,
    sampling_enabled: bool,
    telemetry: Box<dyn MemoryTelemetry>,
    thresholds: Box<dyn ThresholdSource>,
}

impl std::fmt::Debug for MemoryPressureGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPressureGovernor")
            .field("state", &self.state)
            .field("system_state", &self.system_state)
            .field("self_state", &self.self_state)
            .field("tracked", &self.watches.len())
            .field("sampling_enabled", &self.sampling_enabled)
            .finish()
    }
}

impl MemoryPressureGovernor {
    /// Create a governor. Sampling stays disabled until boot finishes.
    pub fn new(
        config: MemoryConfig,
        telemetry: Box<dyn MemoryTelemetry>,
        thresholds: Box<dyn ThresholdSource>,
    ) -> Self {
        Self {
            config,
            system_state: MemoryState::Normal,
            self_state: MemoryState::Normal,
            state: MemoryState::Normal,
            watches: BTreeMap::new(),
            sampling_enabled: false,
            telemetry,
            thresholds,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Current effective state.
    #[must_use]
    pub fn state(&self) -> MemoryState {
        self.state
    }

    #[must_use]
    pub fn sampling_enabled(&self) -> bool {
        self.sampling_enabled
    }

    pub fn set_sampling_enabled(&mut self, enabled: bool) {
        self.sampling_enabled = enabled && self.config.enabled;
    }

    /// Start enforcing a quota for `pid`.
    pub fn track(&mut self, pid: ProcessId, max_memory_allowed_mb: u64) {
        debug!(%pid, quota_mb = max_memory_allowed_mb, "tracking process memory");
        self.watches.insert(
            pid,
            ProcessMemoryWatch {
                pid,
                max_memory_allowed_mb,
                violation_count: 0,
                last_rss_mb: 0,
            },
        );
    }

    /// Stop tracking `pid`. Idempotent.
    pub fn untrack(&mut self, pid: ProcessId) -> Option<ProcessMemoryWatch> {
        self.watches.remove(&pid)
    }

    #[must_use]
    pub fn watch(&self, pid: ProcessId) -> Option<&ProcessMemoryWatch> {
        self.watches.get(&pid)
    }

    pub fn watches(&self) -> impl Iterator<Item = &ProcessMemoryWatch> {
        self.watches.values()
    }

    /// Current system threshold table.
    #[must_use]
    pub fn thresholds(&self) -> ThresholdTable {
        self.thresholds.thresholds()
    }

    /// Asynchronous threshold-crossing notification from the system.
    pub fn on_threshold_crossing(&mut self, state: MemoryState) -> Vec<GovernorAction> {
        self.system_state = state;
        let mut actions = Vec::new();
        self.reconcile(&mut actions);
        actions
    }

    /// One sampling pass: self RSS, then every tracked process.
    pub fn tick(&mut self) -> Vec<GovernorAction> {
        let mut actions = Vec::new();
        if !self.sampling_enabled {
            return actions;
        }

        if let Some(rss_kb) = self.telemetry.self_rss_kb() {
            self.self_state = self.config.classify_self(rss_kb / 1024);
        }
        self.reconcile(&mut actions);

        if self.state == MemoryState::Medium && !actions.contains(&GovernorAction::TrimAllocator)
        {
            actions.push(GovernorAction::TrimAllocator);
        }

        self.sample_processes(&mut actions);
        actions
    }

    fn sample_processes(&mut self, actions: &mut Vec<GovernorAction>) {
        let state = self.state;
        let threshold = self.config.violation_threshold;
        let mut removed = Vec::new();

        for watch in self.watches.values_mut() {
            let Some(rss_kb) = self.telemetry.process_rss_kb(watch.pid) else {
                debug!(pid = %watch.pid, "tracked process exited; dropping quota watch");
                removed.push(watch.pid);
                continue;
            };
            let rss_mb = rss_kb / 1024;
            watch.last_rss_mb = rss_mb;

            if rss_mb <= watch.max_memory_allowed_mb {
                if watch.violation_count > 0 {
                    debug!(pid = %watch.pid, rss_mb, "process back under quota");
                }
                watch.violation_count = 0;
                continue;
            }

            watch.violation_count = watch.violation_count.saturating_add(1);
            if watch.violation_count > threshold && state != MemoryState::Normal {
                warn!(
                    pid = %watch.pid,
                    rss_mb,
                    quota_mb = watch.max_memory_allowed_mb,
                    violations = watch.violation_count,
                    %state,
                    "process over quota under memory pressure; terminating"
                );
                actions.push(GovernorAction::Kill {
                    pid: watch.pid,
                    rss_mb,
                    quota_mb: watch.max_memory_allowed_mb,
                });
                removed.push(watch.pid);
            } else if watch.violation_count == 1 {
                info!(
                    pid = %watch.pid,
                    rss_mb,
                    quota_mb = watch.max_memory_allowed_mb,
                    "process exceeded memory quota"
                );
            } else {
                debug!(
                    pid = %watch.pid,
                    rss_mb,
                    violations = watch.violation_count,
                    %state,
                    "process still over quota"
                );
            }
        }

        for pid in removed {
            self.watches.remove(&pid);
        }
    }

    fn reconcile(&mut self, actions: &mut Vec<GovernorAction>) {
        let next = self.system_state.max(self.self_state);
        if next == self.state {
            return;
        }
        let previous = self.state;
        self.state = next;
        info!(from = %previous, to = %next, "memory state changed");

        match next {
            MemoryState::Normal => {}
            MemoryState::Medium => actions.push(GovernorAction::TrimAllocator),
            MemoryState::Low | MemoryState::Critical => {
                actions.push(GovernorAction::FlushCache);
                actions.push(GovernorAction::ReapKeptAlive);
            }
        }
        actions.push(GovernorAction::StateChanged { state: next });
    }

    /// Decide whether a launch needing `required_mb` may proceed.
    ///
    /// Native launches also reserve the unused quota of every tracked process
    /// against the headroom left before the critical crossing.
    pub fn admit_launch(&self, required_mb: u64, app_type: AppType) -> Result<(), AdmissionDenied> {
        if self.state >= MemoryState::Low {
            return Err(AdmissionDenied::MemoryPressure { state: self.state });
        }
        if app_type != AppType::Native {
            return Ok(());
        }

        let reserved_mb: u64 = self.watches.values().map(ProcessMemoryWatch::slack_mb).sum();
        let headroom_mb = self.thresholds.thresholds().critical.remaining_mb;
        if required_mb.saturating_add(reserved_mb) > headroom_mb {
            debug!(required_mb, reserved_mb, headroom_mb, "native launch refused");
            return Err(AdmissionDenied::InsufficientHeadroom {
                required_mb,
                headroom_mb: headroom_mb.saturating_sub(reserved_mb),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
