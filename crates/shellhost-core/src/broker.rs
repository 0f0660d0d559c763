//! Broker context and event loop.
//!
//! [`Broker`] owns every component and both collaborator sinks. Components
//! never call each other; they return typed effects ([`GovernorAction`],
//! [`RegistryEffect`], [`BootTransition`]) that the broker applies here.
//! [`Broker::run`] is a single-task cooperative loop: each event is handled
//! to completion, then marked connections are swept.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::boot::{BootSequencer, BootState, BootTransition};
use crate::buffer::{BufferNegotiator, SharedBufferAllocator};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionRegistry, DispatchContext, RegistryEffect, WindowKind};
use crate::error::{Error, Result};
use crate::events::{NoticeSink, PresentationSink, UserNotice};
use crate::ids::{ConnectionId, InstanceId, ProcessId, WindowId};
use crate::instance_cache::{CachedInstance, InstanceCache, InstanceTable};
use crate::ipc::{ControlMessage, PeerMessage, PeerSink};
use crate::memory_pressure::{
    GovernorAction, MemoryConfig, MemoryPressureGovernor, MemoryState, MemoryTelemetry,
    StaticThresholds, ThresholdSource,
};
use crate::proc_stats::MeminfoThresholds;
use crate::spawn::ProcessSpawner;
use crate::supervisor::{LaunchOutcome, LaunchRequest, ProcessSupervisor};
use crate::watchdog::HeadlessWatchdog;

/// Spacing of synthesized idle callbacks while boot waits for the loop to settle.
const IDLE_TICK: Duration = Duration::from_millis(1);

// =============================================================================
// Events
// =============================================================================

/// Everything the event loop reacts to.
pub enum BrokerEvent {
    /// A decoded control message from a connected process.
    Inbound {
        conn: ConnectionId,
        msg: ControlMessage,
    },
    /// A process completed its hello handshake. A refused connection gets
    /// an error on `peer` and `reply` is dropped unanswered.
    Connected {
        pid: ProcessId,
        app_id: String,
        /// Set for a child scene pushed by another app.
        parent: Option<String>,
        peer: Box<dyn PeerSink>,
        reply: Option<oneshot::Sender<ConnectionId>>,
    },
    Disconnected {
        conn: ConnectionId,
    },
    ChildExited {
        pid: ProcessId,
        code: Option<i32>,
    },
    /// Asynchronous system threshold notification.
    ThresholdCrossed(MemoryState),
    Idle,
    LauncherReady,
    SampleTick,
    WatchdogTick,
    NukeTick,
    BootTimeout,
    ResizeExpiry,
    Launch {
        request: LaunchRequest,
        reply: Option<oneshot::Sender<Result<LaunchOutcome>>>,
    },
    /// User asked to close a window. Replies `false` for an unknown window.
    CloseWindow {
        window: WindowId,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Close an app's instance, parking it when policy allows. Replies
    /// `false` when the app is not running.
    CloseApp {
        app_id: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// Toggle the instance cache globally. Disabling flushes it.
    SetCaching(bool),
    Shutdown,
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound { conn, msg } => f
                .debug_struct("Inbound")
                .field("conn", conn)
                .field("kind", &msg.kind())
                .finish(),
            Self::Connected {
                pid,
                app_id,
                parent,
                ..
            } => f
                .debug_struct("Connected")
                .field("pid", pid)
                .field("app_id", app_id)
                .field("parent", parent)
                .finish_non_exhaustive(),
            Self::Disconnected { conn } => {
                f.debug_struct("Disconnected").field("conn", conn).finish()
            }
            Self::ChildExited { pid, code } => f
                .debug_struct("ChildExited")
                .field("pid", pid)
                .field("code", code)
                .finish(),
            Self::ThresholdCrossed(state) => {
                f.debug_tuple("ThresholdCrossed").field(state).finish()
            }
            Self::Idle => write!(f, "Idle"),
            Self::LauncherReady => write!(f, "LauncherReady"),
            Self::SampleTick => write!(f, "SampleTick"),
            Self::WatchdogTick => write!(f, "WatchdogTick"),
            Self::NukeTick => write!(f, "NukeTick"),
            Self::BootTimeout => write!(f, "BootTimeout"),
            Self::ResizeExpiry => write!(f, "ResizeExpiry"),
            Self::Launch { request, .. } => f
                .debug_struct("Launch")
                .field("app_id", &request.app_id)
                .finish_non_exhaustive(),
            Self::CloseWindow { window, .. } => f
                .debug_struct("CloseWindow")
                .field("window", window)
                .finish_non_exhaustive(),
            Self::CloseApp { app_id, .. } => f
                .debug_struct("CloseApp")
                .field("app_id", app_id)
                .finish_non_exhaustive(),
            Self::SetCaching(enabled) => f.debug_tuple("SetCaching").field(enabled).finish(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Pluggable collaborators handed to [`Broker::new`].
pub struct BrokerParts {
    pub spawner: Box<dyn ProcessSpawner>,
    pub telemetry: Box<dyn MemoryTelemetry>,
    pub thresholds: Box<dyn ThresholdSource>,
    pub allocator: Box<dyn SharedBufferAllocator>,
    pub presentation: Box<dyn PresentationSink>,
    pub notices: Box<dyn NoticeSink>,
}

/// Configured static table, else one derived from system meminfo.
#[must_use]
pub fn threshold_source(config: &MemoryConfig) -> Box<dyn ThresholdSource> {
    match config.static_thresholds {
        Some(table) => Box::new(StaticThresholds::new(table)),
        None => Box::new(MeminfoThresholds::new(config.clone())),
    }
}

/// Poll `source` and post [`BrokerEvent::ThresholdCrossed`] whenever the
/// classified state changes. Ends when the broker is gone.
pub async fn watch_thresholds(
    source: Box<dyn ThresholdSource>,
    period: Duration,
    events: mpsc::UnboundedSender<BrokerEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = MemoryState::Normal;
    loop {
        ticker.tick().await;
        let state = source.thresholds().classify();
        if state == last {
            continue;
        }
        debug!(from = %last, to = %state, "system threshold crossed");
        last = state;
        if events.send(BrokerEvent::ThresholdCrossed(state)).is_err() {
            break;
        }
    }
}

// =============================================================================
// Broker
// =============================================================================

/// The explicit context owning every component.
pub struct Broker {
    config: BrokerConfig,
    governor: MemoryPressureGovernor,
    supervisor: ProcessSupervisor,
    registry: ConnectionRegistry,
    negotiator: BufferNegotiator,
    instances: InstanceTable,
    cache: InstanceCache,
    watchdog: HeadlessWatchdog,
    boot: BootSequencer,
    presentation: Box<dyn PresentationSink>,
    notices: Box<dyn NoticeSink>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("boot", &self.boot.state())
            .field("memory_state", &self.governor.state())
            .field("processes", &self.supervisor.len())
            .field("connections", &self.registry.len())
            .field("instances", &self.instances.len())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(config: BrokerConfig, parts: BrokerParts) -> Self {
        Self {
            governor: MemoryPressureGovernor::new(
                config.memory.clone(),
                parts.telemetry,
                parts.thresholds,
            ),
            supervisor: ProcessSupervisor::new(config.supervisor.clone(), parts.spawner),
            registry: ConnectionRegistry::new(),
            negotiator: BufferNegotiator::new(config.buffers.clone(), parts.allocator),
            instances: InstanceTable::new(),
            cache: InstanceCache::new(&config.cache),
            watchdog: HeadlessWatchdog::new(config.watchdog.clone()),
            boot: BootSequencer::new(config.boot.clone()),
            presentation: parts.presentation,
            notices: parts.notices,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub fn governor(&self) -> &MemoryPressureGovernor {
        &self.governor
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn negotiator(&self) -> &BufferNegotiator {
        &self.negotiator
    }

    #[must_use]
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    #[must_use]
    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    #[must_use]
    pub fn watchdog(&self) -> &HeadlessWatchdog {
        &self.watchdog
    }

    #[must_use]
    pub fn boot(&self) -> &BootSequencer {
        &self.boot
    }

    /// Begin the boot sequence. Sampling stays off until boot finishes.
    pub fn start(&mut self) {
        if let Some(transition) = self.boot.start() {
            self.governor.set_sampling_enabled(false);
            self.apply_boot_transition(transition);
        }
    }

    /// Handle one event to completion. Returns `false` on shutdown.
    pub fn handle(&mut self, event: BrokerEvent, now_ms: u64) -> bool {
        match event {
            BrokerEvent::Inbound { conn, msg } => self.inbound(conn, msg, now_ms),
            BrokerEvent::Connected {
                pid,
                app_id,
                parent,
                peer,
                reply,
            } => {
                let accepted = self.connected(pid, &app_id, parent, peer, now_ms);
                if let (Some(conn), Some(reply)) = (accepted, reply) {
                    if reply.send(conn).is_err() {
                        debug!(%conn, %pid, "peer went away before handshake reply");
                    }
                }
            }
            BrokerEvent::Disconnected { conn } => self.disconnected(conn, now_ms),
            BrokerEvent::ChildExited { pid, code } => {
                debug!(%pid, ?code, "child exit reported");
                self.process_gone(pid, now_ms);
            }
            BrokerEvent::ThresholdCrossed(state) => {
                let actions = self.governor.on_threshold_crossing(state);
                self.apply_governor_actions(actions, now_ms);
            }
            BrokerEvent::Idle => {
                if let Some(transition) = self.boot.on_idle(now_ms) {
                    self.apply_boot_transition(transition);
                }
            }
            BrokerEvent::LauncherReady => {
                if let Some(transition) = self.boot.launcher_ready() {
                    self.apply_boot_transition(transition);
                }
            }
            BrokerEvent::SampleTick => {
                let actions = self.governor.tick();
                self.apply_governor_actions(actions, now_ms);
            }
            BrokerEvent::WatchdogTick => self.watchdog_tick(now_ms),
            BrokerEvent::NukeTick => self.fire_nukes(now_ms),
            BrokerEvent::BootTimeout => {
                if let Some(transition) = self.boot.timeout_fired(now_ms) {
                    self.apply_boot_transition(transition);
                }
            }
            BrokerEvent::ResizeExpiry => self.expire_resizes(now_ms),
            BrokerEvent::Launch { request, reply } => {
                let result = self.launch(&request, now_ms);
                if let Err(err) = &result {
                    debug!(app_id = %request.app_id, error = %err, "launch refused");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            BrokerEvent::CloseWindow { window, reply } => {
                let closed = self.close_window(window, now_ms);
                if let Some(reply) = reply {
                    let _ = reply.send(closed);
                }
            }
            BrokerEvent::CloseApp { app_id, reply } => {
                let closed = self.close_app(&app_id, now_ms);
                if let Some(reply) = reply {
                    let _ = reply.send(closed);
                }
            }
            BrokerEvent::SetCaching(enabled) => {
                for entry in self.cache.set_enabled(enabled) {
                    self.destroy_instance(entry.instance, now_ms);
                }
            }
            BrokerEvent::Shutdown => return false,
        }
        true
    }

    // ── launch ──

    /// Launch an app, or bring its running instance to the front.
    ///
    /// Refusals and spawn failures are also reported through the notice sink.
    pub fn launch(&mut self, request: &LaunchRequest, now_ms: u64) -> Result<LaunchOutcome> {
        let outcome = match self.supervisor.launch(request, &mut self.governor, now_ms) {
            Ok(outcome) => outcome,
            Err(err) => {
                match &err {
                    Error::Admission(reason) => self.notices.notify(UserNotice::LaunchDenied {
                        app_id: request.app_id.clone(),
                        reason: reason.clone(),
                    }),
                    Error::Launch(reason) => self.notices.notify(UserNotice::LaunchFailed {
                        app_id: request.app_id.clone(),
                        reason: reason.to_string(),
                    }),
                    _ => {}
                }
                return Err(err);
            }
        };

        match outcome {
            LaunchOutcome::Spawned(pid) => {
                let instance = self.instances.create(&request.app_id, pid, None, now_ms);
                self.watchdog.track(instance, &request.app_id, now_ms);
            }
            LaunchOutcome::BroughtToFront(pid) => self.bring_to_front(pid, now_ms),
        }
        Ok(outcome)
    }

    fn bring_to_front(&mut self, pid: ProcessId, now_ms: u64) {
        for instance in self.instances.by_pid(pid) {
            if self.cache.evict(instance).is_some() {
                debug!(%pid, %instance, "thawed cached instance");
            }
        }
        let Some(conn) = self.registry.connection_for_pid(pid) else {
            return;
        };
        let Some(window) = self.registry.primary_window(conn) else {
            return;
        };
        let effects = self.registry.focus_changed(window);
        self.presentation.focus_window(window);
        self.registry.send_to(
            conn,
            PeerMessage::Focus {
                window,
                focused: true,
            },
        );
        self.apply_registry_effects(effects, now_ms);
    }

    // ── connections ──

    /// Why a hello from `pid` must be turned away, if it must.
    fn refusal(&self, pid: ProcessId, app_id: &str) -> Option<String> {
        let Some(process) = self.supervisor.get(pid) else {
            return Some(format!("pid {pid} was not launched by this broker"));
        };
        if process.app_id != app_id {
            return Some(format!("pid {pid} runs {}, not {app_id}", process.app_id));
        }
        let live = process
            .connection
            .and_then(|conn| self.registry.connection(conn))
            .is_some_and(|c| !c.is_marked_for_removal());
        live.then(|| format!("pid {pid} is already connected"))
    }

    /// Accept a connection from a process this broker launched. Anything
    /// else is refused and never enters the process table.
    fn connected(
        &mut self,
        pid: ProcessId,
        app_id: &str,
        parent: Option<String>,
        mut peer: Box<dyn PeerSink>,
        now_ms: u64,
    ) -> Option<ConnectionId> {
        if let Some(message) = self.refusal(pid, app_id) {
            warn!(%pid, app_id, reason = %message, "connection refused");
            peer.send(PeerMessage::Error { message });
            return None;
        }

        let conn = self.registry.accept(pid, app_id, peer);
        self.supervisor.bind_connection(pid, conn);

        let pending = self
            .instances
            .by_pid(pid)
            .into_iter()
            .find(|id| self.instances.get(*id).is_some_and(|i| i.connection.is_none()));
        let id = match pending {
            Some(id) => id,
            None => {
                let id = self.instances.create(app_id, pid, None, now_ms);
                self.watchdog.track(id, app_id, now_ms);
                id
            }
        };
        if let Some(instance) = self.instances.get_mut(id) {
            instance.connection = Some(conn);
            instance.top_level = parent.is_none();
        }
        if let Some(parent) = parent {
            debug!(%conn, instance = %id, app_id, %parent, "child scene connected");
        }
        Some(conn)
    }

    fn inbound(&mut self, conn: ConnectionId, msg: ControlMessage, now_ms: u64) {
        let mut cx = DispatchContext {
            negotiator: &mut self.negotiator,
            presentation: self.presentation.as_mut(),
            now_ms,
        };
        let effects = self.registry.dispatch(conn, msg, &mut cx);
        self.apply_registry_effects(effects, now_ms);
    }

    fn disconnected(&mut self, conn: ConnectionId, now_ms: u64) {
        let mut cx = DispatchContext {
            negotiator: &mut self.negotiator,
            presentation: self.presentation.as_mut(),
            now_ms,
        };
        if let Some(pid) = self.registry.mark_for_removal(conn, &mut cx) {
            info!(%conn, %pid, "connection lost");
        }
    }

    fn apply_registry_effects(&mut self, effects: Vec<RegistryEffect>, now_ms: u64) {
        for effect in effects {
            match effect {
                RegistryEffect::RequestNuke { pid } => {
                    for id in self.instances.by_pid(pid) {
                        if let Some(instance) = self.instances.get_mut(id) {
                            instance.shutting_down = true;
                        }
                    }
                    self.supervisor.add_to_nuke_list(pid, now_ms);
                }
                RegistryEffect::SetPriority { pid, priority } => {
                    self.supervisor.set_priority(pid, priority);
                }
                RegistryEffect::WindowAdded {
                    conn, window, kind, ..
                } => {
                    let Some(id) = self.instances.by_connection(conn) else {
                        continue;
                    };
                    let count = self.registry.window_count(conn);
                    if let Some(instance) = self.instances.get_mut(id) {
                        instance.dependent_windows = count;
                        if kind == WindowKind::Card && instance.headless {
                            instance.headless = false;
                            self.watchdog.untrack(id);
                            debug!(instance = %id, window_id = %window, "instance no longer headless");
                        }
                    }
                    self.cache.evict(id);
                }
                RegistryEffect::WindowRemoved {
                    conn, remaining, ..
                } => self.window_removed(conn, remaining, now_ms),
                RegistryEffect::Loaded { conn, .. } => {
                    if let Some(instance) = self
                        .instances
                        .by_connection(conn)
                        .and_then(|id| self.instances.get_mut(id))
                    {
                        instance.loaded = true;
                        debug!(instance = %instance.id, app_id = %instance.app_id, "instance loaded");
                    }
                }
            }
        }
    }

    /// Last window gone: the instance is headless again unless it is
    /// parked or already queued for a nuke.
    fn window_removed(&mut self, conn: ConnectionId, remaining: usize, now_ms: u64) {
        let Some(id) = self.instances.by_connection(conn) else {
            return;
        };
        let parked = self.cache.contains(id);
        let Some(instance) = self.instances.get_mut(id) else {
            return;
        };
        instance.dependent_windows = remaining;
        if remaining > 0 || instance.headless || parked || instance.shutting_down {
            return;
        }
        instance.headless = true;
        let app_id = instance.app_id.clone();
        self.watchdog.track(id, app_id, now_ms);
    }

    // ── closing and teardown ──

    /// Close one window at the user's request.
    ///
    /// When this is the instance's last open window and the keep-alive policy
    /// allows it, the instance is parked instead of being nuked.
    pub fn close_window(&mut self, window: WindowId, now_ms: u64) -> bool {
        let Some(conn) = self.registry.window(window).map(|w| w.connection) else {
            return false;
        };
        let last_open = self.registry.connection(conn).is_some_and(|c| {
            c.windows()
                .iter()
                .all(|w| *w == window || c.pending_close().contains(w))
        });
        let instance = self.instances.by_connection(conn);
        let park = last_open
            && instance
                .and_then(|id| self.instances.get(id))
                .is_some_and(|i| self.cache.should_park(i));

        let effects = self.registry.close_window(window, park);
        if park {
            if let Some(instance) = instance.and_then(|id| self.instances.get(id)) {
                self.cache.park(CachedInstance {
                    instance: instance.id,
                    app_id: instance.app_id.clone(),
                    parked_at_ms: now_ms,
                });
            }
        }
        self.apply_registry_effects(effects, now_ms);
        true
    }

    /// Close the running instance of `app_id`. Returns `false` when there is
    /// none.
    pub fn close_app(&mut self, app_id: &str, now_ms: u64) -> bool {
        let Some(id) = self.instances.by_app_id(app_id) else {
            return false;
        };
        self.close_instance(id, now_ms);
        true
    }

    /// Park or destroy an instance per the keep-alive policy.
    pub fn close_instance(&mut self, id: InstanceId, now_ms: u64) {
        let Some(instance) = self.instances.get(id) else {
            return;
        };
        if !self.cache.should_park(instance) {
            self.destroy_instance(id, now_ms);
            return;
        }
        let entry = CachedInstance {
            instance: id,
            app_id: instance.app_id.clone(),
            parked_at_ms: now_ms,
        };
        let windows: Vec<WindowId> = instance
            .connection
            .and_then(|conn| self.registry.connection(conn))
            .map(|c| c.windows().iter().copied().collect())
            .unwrap_or_default();
        self.cache.park(entry);
        self.watchdog.untrack(id);
        for window in windows {
            let effects = self.registry.close_window(window, true);
            self.apply_registry_effects(effects, now_ms);
        }
    }

    /// Tear an instance down; its process goes with it once it has no
    /// other instance.
    pub fn destroy_instance(&mut self, id: InstanceId, now_ms: u64) {
        self.cache.evict(id);
        self.watchdog.untrack(id);
        let Some(instance) = self.instances.remove(id) else {
            return;
        };
        info!(instance = %id, app_id = %instance.app_id, pid = %instance.pid, "instance destroyed");
        if self.instances.by_pid(instance.pid).is_empty() {
            self.kill_process(instance.pid, false, now_ms);
        }
    }

    /// Terminate `pid` and drop everything that refers to it.
    pub fn kill_process(&mut self, pid: ProcessId, notify_user: bool, now_ms: u64) -> bool {
        let Some(process) = self.supervisor.kill(pid) else {
            return false;
        };
        if notify_user {
            self.notices.notify(UserNotice::ForcedClose {
                app_id: process.app_id.clone(),
            });
        }
        self.process_gone(pid, now_ms);
        true
    }

    /// Bookkeeping for a process that is gone, whatever the cause. Idempotent.
    fn process_gone(&mut self, pid: ProcessId, now_ms: u64) {
        self.supervisor.child_exited(pid);
        self.governor.untrack(pid);
        for id in self.instances.by_pid(pid) {
            self.cache.evict(id);
            self.watchdog.untrack(id);
            self.instances.remove(id);
        }
        if let Some(conn) = self.registry.connection_for_pid(pid) {
            let mut cx = DispatchContext {
                negotiator: &mut self.negotiator,
                presentation: self.presentation.as_mut(),
                now_ms,
            };
            self.registry.mark_for_removal(conn, &mut cx);
        }
    }

    /// Idle phase: destroy connections marked for removal. A process whose
    /// connection dropped is treated as dead.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let destroyed = self.registry.sweep();
        for (conn, pid) in &destroyed {
            debug!(%conn, %pid, "swept connection");
            if self.supervisor.get(*pid).is_some() {
                self.kill_process(*pid, false, now_ms);
            } else {
                self.process_gone(*pid, now_ms);
            }
        }
        destroyed.len()
    }

    // ── timers ──

    fn fire_nukes(&mut self, now_ms: u64) {
        for process in self.supervisor.fire_nukes(now_ms) {
            info!(pid = %process.pid, app_id = %process.app_id, "nuked");
            self.process_gone(process.pid, now_ms);
        }
    }

    fn watchdog_tick(&mut self, now_ms: u64) {
        if !self.watchdog.should_fire(now_ms) {
            return;
        }
        let instances = &self.instances;
        let expired = self
            .watchdog
            .sweep(now_ms, self.boot.is_finished(), |id| has_dependents(instances, id));
        for id in expired {
            self.destroy_instance(id, now_ms);
        }
    }

    fn expire_resizes(&mut self, now_ms: u64) {
        for aborted in self.negotiator.expire_resizes(now_ms) {
            let Some(conn) = self.registry.window(aborted.window).map(|w| w.connection) else {
                continue;
            };
            self.registry.send_to(
                conn,
                PeerMessage::ResizeFailed {
                    window: aborted.window,
                    key: Some(aborted.restored),
                    reason: format!("resize of window {} timed out", aborted.window),
                },
            );
        }
    }

    /// Earliest one-shot deadline: nuke, boot, or resize.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.supervisor.nuke_deadline(),
            self.boot.deadline(),
            self.negotiator.next_resize_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire whichever one-shot deadlines are due.
    pub fn fire_deadlines(&mut self, now_ms: u64) {
        self.handle(BrokerEvent::NukeTick, now_ms);
        self.handle(BrokerEvent::BootTimeout, now_ms);
        self.handle(BrokerEvent::ResizeExpiry, now_ms);
    }

    // ── component actions ──

    fn apply_governor_actions(&mut self, actions: Vec<GovernorAction>, now_ms: u64) {
        for action in actions {
            match action {
                GovernorAction::Kill { pid, .. } => {
                    self.kill_process(pid, true, now_ms);
                }
                GovernorAction::TrimAllocator => {
                    let freed = self.negotiator.trim();
                    debug!(freed, "allocator trimmed");
                }
                GovernorAction::FlushCache => {
                    for entry in self.cache.flush_all() {
                        self.destroy_instance(entry.instance, now_ms);
                    }
                }
                GovernorAction::ReapKeptAlive => {
                    let instances = &self.instances;
                    let policy = self.cache.policy();
                    let victims = self.watchdog.reap_kept_alive(|id| {
                        instances.get(id).is_some_and(|i| {
                            policy.is_keep_alive(&i.app_id)
                                && i.loaded
                                && !i.shutting_down
                                && i.dependent_windows == 0
                        })
                    });
                    for id in victims {
                        self.destroy_instance(id, now_ms);
                    }
                }
                GovernorAction::StateChanged { state } => {
                    self.notices.notify(UserNotice::MemoryStateChanged { state });
                }
            }
        }
    }

    fn apply_boot_transition(&mut self, transition: BootTransition) {
        match transition {
            BootTransition::WaitingForIdle => debug!("waiting for event loop to settle"),
            BootTransition::WaitingForLauncher { deadline_ms } => {
                debug!(deadline_ms, "waiting for launcher");
            }
            BootTransition::Finished => {
                self.governor.set_sampling_enabled(self.config.memory.enabled);
                self.presentation.boot_finished();
            }
        }
    }

    /// Terminate every supervised process.
    pub fn shutdown(&mut self, now_ms: u64) {
        let pids = self.supervisor.pids();
        info!(processes = pids.len(), "broker shutting down");
        for pid in pids {
            self.kill_process(pid, false, now_ms);
        }
        self.sweep(now_ms);
    }

    // ── event loop ──

    /// Run until [`BrokerEvent::Shutdown`], the channel closes, or
    /// `shutdown_flag` is set. Time is measured from loop start.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<BrokerEvent>,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Self {
        let origin = Instant::now();
        let now_ms = move || origin.elapsed().as_millis() as u64;

        let mut sample = tokio::time::interval(Duration::from_millis(
            self.config.memory.sample_interval_ms,
        ));
        sample.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watchdog = tokio::time::interval(Duration::from_millis(
            self.config.watchdog.check_interval_ms,
        ));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start();
        info!("broker running");

        loop {
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }
            let deadline = self
                .next_deadline()
                .map(|ms| origin + Duration::from_millis(ms));
            let settling = self.boot.state() == BootState::WaitingForIdle;

            let keep_going = tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle(event, now_ms()),
                    None => false,
                },
                _ = sample.tick() => self.handle(BrokerEvent::SampleTick, now_ms()),
                _ = watchdog.tick() => self.handle(BrokerEvent::WatchdogTick, now_ms()),
                () = sleep_until_deadline(deadline) => {
                    self.fire_deadlines(now_ms());
                    true
                }
                () = tokio::time::sleep(IDLE_TICK), if settling => {
                    self.handle(BrokerEvent::Idle, now_ms())
                }
            };
            self.sweep(now_ms());
            if !keep_going {
                break;
            }
        }

        self.shutdown(now_ms());
        self
    }
}

fn has_dependents(instances: &InstanceTable, id: InstanceId) -> bool {
    instances.get(id).is_some_and(|i| i.dependent_windows > 0)
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
