//! Connection registry: per-process window routing and the close protocol.
//!
//! Windows live in a single arena addressed by [`WindowId`]; connections,
//! the presentation layer and the buffer negotiator refer to them by id only.
//! A disconnect detaches every window synchronously
//! ([`ConnectionRegistry::mark_for_removal`]) and the connection itself is
//! destroyed later by [`ConnectionRegistry::sweep`], outside any dispatch.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::BufferNegotiator;
use crate::events::PresentationSink;
use crate::ids::{BufferKey, ConnectionId, IdGen, ProcessId, WindowId};
use crate::ipc::{ControlMessage, PeerMessage, PeerSink};
use crate::supervisor::Priority;

/// Role of a window in the shell.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    #[default]
    Card,
    Dashboard,
    Popup,
    Banner,
    Overlay,
    Emergency,
}

impl WindowKind {
    /// Closing every window of a process normally queues it for a nuke;
    /// these kinds never do.
    #[must_use]
    pub const fn is_nuke_exempt(self) -> bool {
        matches!(self, Self::Banner | Self::Dashboard)
    }
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card => write!(f, "card"),
            Self::Dashboard => write!(f, "dashboard"),
            Self::Popup => write!(f, "popup"),
            Self::Banner => write!(f, "banner"),
            Self::Overlay => write!(f, "overlay"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Arena entry for one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRecord {
    pub id: WindowId,
    pub connection: ConnectionId,
    pub kind: WindowKind,
    pub properties: BTreeMap<String, String>,
    /// Handed to the presentation layer.
    pub added: bool,
    pub pending_close: bool,
}

/// One connected application process.
pub struct Connection {
    pub id: ConnectionId,
    pub pid: ProcessId,
    pub app_id: String,
    routing: HashMap<BufferKey, WindowId>,
    windows: BTreeSet<WindowId>,
    pending_close: BTreeSet<WindowId>,
    marked_for_removal: bool,
    peer: Box<dyn PeerSink>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("app_id", &self.app_id)
            .field("windows", &self.windows)
            .field("pending_close", &self.pending_close)
            .field("marked_for_removal", &self.marked_for_removal)
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[must_use]
    pub fn windows(&self) -> &BTreeSet<WindowId> {
        &self.windows
    }

    #[must_use]
    pub fn pending_close(&self) -> &BTreeSet<WindowId> {
        &self.pending_close
    }

    #[must_use]
    pub fn is_marked_for_removal(&self) -> bool {
        self.marked_for_removal
    }

    /// Window owning `key`, if routed through this connection.
    #[must_use]
    pub fn route(&self, key: BufferKey) -> Option<WindowId> {
        self.routing.get(&key).copied()
    }
}

/// Borrowed collaborators needed while dispatching.
pub struct DispatchContext<'a> {
    pub negotiator: &'a mut BufferNegotiator,
    pub presentation: &'a mut dyn PresentationSink,
    pub now_ms: u64,
}

/// Follow-up work for components the registry does not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEffect {
    /// Every window of `pid` is closing.
    RequestNuke { pid: ProcessId },
    SetPriority { pid: ProcessId, priority: Priority },
    WindowAdded {
        conn: ConnectionId,
        pid: ProcessId,
        window: WindowId,
        kind: WindowKind,
    },
    WindowRemoved {
        conn: ConnectionId,
        pid: ProcessId,
        window: WindowId,
        remaining: usize,
    },
    Loaded { conn: ConnectionId, pid: ProcessId },
}

/// Owns every connection and the window arena.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connection_ids: IdGen,
    window_ids: IdGen,
    connections: BTreeMap<ConnectionId, Connection>,
    windows: BTreeMap<WindowId, WindowRecord>,
    by_pid: HashMap<ProcessId, ConnectionId>,
    focused: Option<WindowId>,
    active_pid: Option<ProcessId>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected process.
    pub fn accept(
        &mut self,
        pid: ProcessId,
        app_id: impl Into<String>,
        peer: Box<dyn PeerSink>,
    ) -> ConnectionId {
        let id = ConnectionId(self.connection_ids.next_raw());
        let app_id = app_id.into();
        if let Some(previous) = self.by_pid.insert(pid, id) {
            warn!(%pid, %previous, conn = %id, "process opened a second connection");
        }
        info!(%pid, %app_id, conn = %id, "connection accepted");
        self.connections.insert(
            id,
            Connection {
                id,
                pid,
                app_id,
                routing: HashMap::new(),
                windows: BTreeSet::new(),
                pending_close: BTreeSet::new(),
                marked_for_removal: false,
                peer,
            },
        );
        id
    }

    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    #[must_use]
    pub fn connection_for_pid(&self, pid: ProcessId) -> Option<ConnectionId> {
        self.by_pid.get(&pid).copied()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    #[must_use]
    pub fn window(&self, id: WindowId) -> Option<&WindowRecord> {
        self.windows.get(&id)
    }

    #[must_use]
    pub fn window_count(&self, conn: ConnectionId) -> usize {
        self.connections.get(&conn).map_or(0, |c| c.windows.len())
    }

    /// First card window of `conn`, used to bring an app to the front.
    #[must_use]
    pub fn primary_window(&self, conn: ConnectionId) -> Option<WindowId> {
        let connection = self.connections.get(&conn)?;
        connection
            .windows
            .iter()
            .copied()
            .find(|id| self.windows.get(id).is_some_and(|w| w.kind == WindowKind::Card))
    }

    #[must_use]
    pub fn focused(&self) -> Option<WindowId> {
        self.focused
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send to the peer of `conn`. Returns `false` if it is gone or marked.
    pub fn send_to(&mut self, conn: ConnectionId, message: PeerMessage) -> bool {
        match self.connections.get_mut(&conn) {
            Some(c) if !c.marked_for_removal => c.peer.send(message),
            _ => false,
        }
    }

    fn owns(&self, conn: ConnectionId, window: WindowId) -> bool {
        self.windows
            .get(&window)
            .is_some_and(|w| w.connection == conn)
    }

    /// Route one inbound message. Messages from marked connections are ignored.
    pub fn dispatch(
        &mut self,
        conn: ConnectionId,
        msg: ControlMessage,
        cx: &mut DispatchContext<'_>,
    ) -> Vec<RegistryEffect> {
        let Some(connection) = self.connections.get(&conn) else {
            debug!(%conn, kind = msg.kind(), "message for unknown connection dropped");
            return Vec::new();
        };
        if connection.marked_for_removal {
            debug!(%conn, kind = msg.kind(), "message from closing connection ignored");
            return Vec::new();
        }
        let pid = connection.pid;

        if let Some(window) = target_window(&msg) {
            if !self.owns(conn, window) {
                debug!(%conn, window_id = %window, kind = msg.kind(), "message for foreign window rejected");
                self.send_to(
                    conn,
                    PeerMessage::Error {
                        message: format!("unknown window {window}"),
                    },
                );
                return Vec::new();
            }
        }

        let mut effects = Vec::new();
        match msg {
            ControlMessage::Hello { .. } => {
                debug!(%conn, "duplicate hello ignored");
            }
            ControlMessage::Loaded => effects.push(RegistryEffect::Loaded { conn, pid }),
            ControlMessage::PrepareWindow {
                width,
                height,
                has_alpha,
                kind,
            } => self.prepare_window(conn, width, height, has_alpha, kind, cx),
            ControlMessage::AddWindow { window } => {
                if let Some(effect) = self.add_window(conn, pid, window, cx) {
                    effects.push(effect);
                }
            }
            ControlMessage::RemoveWindow { window } | ControlMessage::CloseAck { window } => {
                let remaining = self.detach_window(window, cx);
                effects.push(RegistryEffect::WindowRemoved {
                    conn,
                    pid,
                    window,
                    remaining,
                });
            }
            ControlMessage::SetProperties { window, properties } => {
                if let Some(record) = self.windows.get_mut(&window) {
                    record.properties.extend(properties);
                }
            }
            ControlMessage::Focus { window } => {
                effects.extend(self.focus_changed(window));
                cx.presentation.focus_window(window);
                self.send_to(
                    conn,
                    PeerMessage::Focus {
                        window,
                        focused: true,
                    },
                );
            }
            ControlMessage::Unfocus { window } => {
                if self.focused == Some(window) {
                    self.focused = None;
                    if self.active_pid == Some(pid) {
                        self.active_pid = None;
                        effects.push(RegistryEffect::SetPriority {
                            pid,
                            priority: Priority::Background,
                        });
                    }
                }
                self.send_to(
                    conn,
                    PeerMessage::Focus {
                        window,
                        focused: false,
                    },
                );
            }
            ControlMessage::ResizeRequest {
                window,
                width,
                height,
            } => {
                let reply = match cx.negotiator.begin_resize(window, width, height, cx.now_ms) {
                    Ok(key) => PeerMessage::ResizeReply { window, key },
                    Err(err) => PeerMessage::ResizeFailed {
                        window,
                        key: cx.negotiator.key_of(window),
                        reason: err.to_string(),
                    },
                };
                self.send_to(conn, reply);
            }
            ControlMessage::ResizeAck { window, key } => self.resize_ack(conn, window, key, cx),
            ControlMessage::FlipRequest {
                window,
                width,
                height,
            } => {
                let reply = match cx.negotiator.flip(window, width, height) {
                    Ok(buffer) => {
                        cx.presentation.repaint(window, buffer.key);
                        PeerMessage::FlipAck {
                            window,
                            width: buffer.width,
                            height: buffer.height,
                        }
                    }
                    Err(err) => PeerMessage::Error {
                        message: err.to_string(),
                    },
                };
                self.send_to(conn, reply);
            }
            ControlMessage::Routed { key, payload } => {
                match self.connections.get(&conn).and_then(|c| c.route(key)) {
                    Some(window) => cx.presentation.deliver(window, &payload),
                    None => debug!(%conn, %key, "routed payload for unknown key dropped"),
                }
            }
        }
        effects
    }

    fn prepare_window(
        &mut self,
        conn: ConnectionId,
        width: u32,
        height: u32,
        has_alpha: bool,
        kind: WindowKind,
        cx: &mut DispatchContext<'_>,
    ) {
        let window = WindowId(self.window_ids.next_raw());
        let reply = match cx.negotiator.prepare(window, width, height, has_alpha) {
            Ok((key, metadata_key)) => {
                self.windows.insert(
                    window,
                    WindowRecord {
                        id: window,
                        connection: conn,
                        kind,
                        properties: BTreeMap::new(),
                        added: false,
                        pending_close: false,
                    },
                );
                if let Some(c) = self.connections.get_mut(&conn) {
                    c.windows.insert(window);
                    c.routing.insert(key, window);
                }
                debug!(%conn, window_id = %window, %kind, %key, "window prepared");
                PeerMessage::Prepared {
                    window,
                    key,
                    metadata_key,
                }
            }
            Err(err) => {
                warn!(%conn, error = %err, "prepare window failed");
                PeerMessage::Error {
                    message: err.to_string(),
                }
            }
        };
        self.send_to(conn, reply);
    }

    fn add_window(
        &mut self,
        conn: ConnectionId,
        pid: ProcessId,
        window: WindowId,
        cx: &mut DispatchContext<'_>,
    ) -> Option<RegistryEffect> {
        let app_id = self.connections.get(&conn)?.app_id.clone();
        let record = self.windows.get_mut(&window)?;
        if record.added {
            return None;
        }
        record.added = true;
        cx.presentation.add_window(window, record.kind, &app_id);
        Some(RegistryEffect::WindowAdded {
            conn,
            pid,
            window,
            kind: record.kind,
        })
    }

    fn resize_ack(
        &mut self,
        conn: ConnectionId,
        window: WindowId,
        key: BufferKey,
        cx: &mut DispatchContext<'_>,
    ) {
        let old = cx.negotiator.key_of(window);
        let reply = match cx.negotiator.complete_resize(window, key) {
            Ok(repaint) => {
                if let Some(c) = self.connections.get_mut(&conn) {
                    if let Some(old) = old {
                        c.routing.remove(&old);
                    }
                    c.routing.insert(repaint.buffer.key, window);
                }
                cx.presentation.repaint(window, repaint.buffer.key);
                self.send_to(
                    conn,
                    PeerMessage::Resized {
                        window,
                        key: repaint.buffer.key,
                        width: repaint.buffer.width,
                        height: repaint.buffer.height,
                    },
                );
                PeerMessage::Repaint { window }
            }
            Err(err) => PeerMessage::ResizeFailed {
                window,
                key: cx.negotiator.key_of(window),
                reason: err.to_string(),
            },
        };
        self.send_to(conn, reply);
    }

    /// Make the owner of `window` Active and the previous owner Background.
    pub fn focus_changed(&mut self, window: WindowId) -> Vec<RegistryEffect> {
        let Some(pid) = self
            .windows
            .get(&window)
            .and_then(|w| self.connections.get(&w.connection))
            .map(|c| c.pid)
        else {
            return Vec::new();
        };
        self.focused = Some(window);
        if self.active_pid == Some(pid) {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if let Some(previous) = self.active_pid.replace(pid) {
            effects.push(RegistryEffect::SetPriority {
                pid: previous,
                priority: Priority::Background,
            });
        }
        effects.push(RegistryEffect::SetPriority {
            pid,
            priority: Priority::Active,
        });
        effects
    }

    /// Ask the peer to close `window`.
    ///
    /// Once every window of the process is pending close, a nuke is requested
    /// unless `keep_alive` is set or one of the windows is exempt.
    pub fn close_window(&mut self, window: WindowId, keep_alive: bool) -> Vec<RegistryEffect> {
        let Some(record) = self.windows.get_mut(&window) else {
            return Vec::new();
        };
        if record.pending_close {
            return Vec::new();
        }
        record.pending_close = true;
        let conn = record.connection;

        let Some(connection) = self.connections.get_mut(&conn) else {
            return Vec::new();
        };
        if connection.marked_for_removal {
            return Vec::new();
        }
        connection.pending_close.insert(window);
        connection.peer.send(PeerMessage::Close { window, keep_alive });
        debug!(%conn, window_id = %window, keep_alive, "close requested");

        if keep_alive || connection.pending_close != connection.windows {
            return Vec::new();
        }
        let exempt = connection
            .windows
            .iter()
            .filter_map(|id| self.windows.get(id))
            .any(|w| w.kind.is_nuke_exempt());
        if exempt {
            debug!(%conn, "all windows closing but an exempt window remains; no nuke");
            return Vec::new();
        }
        vec![RegistryEffect::RequestNuke {
            pid: connection.pid,
        }]
    }

    /// Remove a window from every index and release its buffers.
    /// Returns how many windows its connection still has.
    fn detach_window(&mut self, window: WindowId, cx: &mut DispatchContext<'_>) -> usize {
        let Some(record) = self.windows.remove(&window) else {
            return 0;
        };
        cx.negotiator.release_window(window);
        if record.added {
            cx.presentation.remove_window(window);
        }
        if self.focused == Some(window) {
            self.focused = None;
        }
        let Some(connection) = self.connections.get_mut(&record.connection) else {
            return 0;
        };
        connection.windows.remove(&window);
        connection.pending_close.remove(&window);
        connection.routing.retain(|_, w| *w != window);
        connection.windows.len()
    }

    /// Phase one of teardown: flag the connection and detach its windows.
    ///
    /// Returns the pid on the first call only.
    pub fn mark_for_removal(
        &mut self,
        conn: ConnectionId,
        cx: &mut DispatchContext<'_>,
    ) -> Option<ProcessId> {
        let connection = self.connections.get_mut(&conn)?;
        if connection.marked_for_removal {
            return None;
        }
        connection.marked_for_removal = true;
        let pid = connection.pid;
        let windows: Vec<WindowId> = connection.windows.iter().copied().collect();
        for window in &windows {
            self.detach_window(*window, cx);
        }
        if self.active_pid == Some(pid) {
            self.active_pid = None;
        }
        info!(%conn, %pid, detached = windows.len(), "connection marked for removal");
        Some(pid)
    }

    /// Phase two: destroy marked connections. Returns what was destroyed.
    pub fn sweep(&mut self) -> Vec<(ConnectionId, ProcessId)> {
        let marked: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.marked_for_removal)
            .map(|c| c.id)
            .collect();

        marked
            .into_iter()
            .filter_map(|id| {
                let connection = self.connections.remove(&id)?;
                if self.by_pid.get(&connection.pid) == Some(&id) {
                    self.by_pid.remove(&connection.pid);
                }
                debug!(conn = %id, pid = %connection.pid, "connection destroyed");
                Some((id, connection.pid))
            })
            .collect()
    }
}

fn target_window(msg: &ControlMessage) -> Option<WindowId> {
    match msg {
        ControlMessage::AddWindow { window }
        | ControlMessage::RemoveWindow { window }
        | ControlMessage::SetProperties { window, .. }
        | ControlMessage::Focus { window }
        | ControlMessage::Unfocus { window }
        | ControlMessage::ResizeRequest { window, .. }
        | ControlMessage::ResizeAck { window, .. }
        | ControlMessage::FlipRequest { window, .. }
        | ControlMessage::CloseAck { window } => Some(*window),
        ControlMessage::Hello { .. }
        | ControlMessage::Loaded
        | ControlMessage::PrepareWindow { .. }
        | ControlMessage::Routed { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferConfig, HeapBufferAllocator};
    use crate::events::{PresentationEvent, RecordingPresentation};
    use crate::ipc::RecordingPeer;

    struct Harness {
        registry: ConnectionRegistry,
        negotiator: BufferNegotiator,
        presentation: RecordingPresentation,
        sink: RecordingPresentation,
    }

    impl Harness {
        fn new() -> Self {
            let presentation = RecordingPresentation::new();
            Self {
                registry: ConnectionRegistry::new(),
                negotiator: BufferNegotiator::new(
                    BufferConfig::default(),
                    Box::new(HeapBufferAllocator::new()),
                ),
                sink: presentation.clone(),
                presentation,
            }
        }

        fn dispatch(&mut self, conn: ConnectionId, msg: ControlMessage) -> Vec<RegistryEffect> {
            let mut cx = DispatchContext {
                negotiator: &mut self.negotiator,
                presentation: &mut self.sink,
                now_ms: 0,
            };
            self.registry.dispatch(conn, msg, &mut cx)
        }

        fn connect(&mut self, pid: u32) -> (ConnectionId, RecordingPeer) {
            let peer = RecordingPeer::new();
            let conn = self
                .registry
                .accept(ProcessId(pid), format!("app.{pid}"), Box::new(peer.clone()));
            (conn, peer)
        }

        fn open_window(
            &mut self,
            conn: ConnectionId,
            peer: &RecordingPeer,
            kind: WindowKind,
        ) -> (WindowId, BufferKey) {
            self.dispatch(
                conn,
                ControlMessage::PrepareWindow {
                    width: 64,
                    height: 32,
                    has_alpha: false,
                    kind,
                },
            );
            let Some(PeerMessage::Prepared { window, key, .. }) = peer.take().pop() else {
                panic!("expected prepared");
            };
            self.dispatch(conn, ControlMessage::AddWindow { window });
            (window, key)
        }
    }

    #[test]
    fn prepare_and_add_window() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (window, key) = h.open_window(conn, &peer, WindowKind::Card);
        assert_eq!(h.registry.connection(conn).unwrap().route(key), Some(window));
        assert_eq!(
            h.presentation.events(),
            vec![PresentationEvent::Added {
                window,
                kind: WindowKind::Card,
                app_id: "app.10".into()
            }]
        );
        assert_eq!(h.registry.primary_window(conn), Some(window));
    }

    #[test]
    fn foreign_window_is_rejected() {
        let mut h = Harness::new();
        let (a, peer_a) = h.connect(1);
        let (b, peer_b) = h.connect(2);
        let (window, _) = h.open_window(a, &peer_a, WindowKind::Card);
        let effects = h.dispatch(b, ControlMessage::RemoveWindow { window });
        assert!(effects.is_empty());
        assert!(h.registry.window(window).is_some());
        assert!(matches!(
            peer_b.take().as_slice(),
            [PeerMessage::Error { .. }]
        ));
    }

    #[test]
    fn close_last_window_requests_nuke() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (w1, _) = h.open_window(conn, &peer, WindowKind::Card);
        let (w2, _) = h.open_window(conn, &peer, WindowKind::Popup);
        assert!(h.registry.close_window(w1, false).is_empty());
        assert_eq!(
            h.registry.close_window(w2, false),
            vec![RegistryEffect::RequestNuke { pid: ProcessId(10) }]
        );
        assert!(h.registry.close_window(w2, false).is_empty());
        assert_eq!(
            peer.take(),
            vec![
                PeerMessage::Close {
                    window: w1,
                    keep_alive: false
                },
                PeerMessage::Close {
                    window: w2,
                    keep_alive: false
                },
            ]
        );
    }

    #[test]
    fn exempt_kinds_never_request_nuke() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (banner, _) = h.open_window(conn, &peer, WindowKind::Banner);
        assert!(h.registry.close_window(banner, false).is_empty());

        let (conn2, peer2) = h.connect(11);
        let (card, _) = h.open_window(conn2, &peer2, WindowKind::Card);
        assert!(h.registry.close_window(card, true).is_empty());
    }

    #[test]
    fn focus_swaps_priorities_without_redundant_writes() {
        let mut h = Harness::new();
        let (a, peer_a) = h.connect(1);
        let (b, peer_b) = h.connect(2);
        let (wa, _) = h.open_window(a, &peer_a, WindowKind::Card);
        let (wa2, _) = h.open_window(a, &peer_a, WindowKind::Card);
        let (wb, _) = h.open_window(b, &peer_b, WindowKind::Card);

        assert_eq!(
            h.dispatch(a, ControlMessage::Focus { window: wa }),
            vec![RegistryEffect::SetPriority {
                pid: ProcessId(1),
                priority: Priority::Active
            }]
        );
        assert!(h.dispatch(a, ControlMessage::Focus { window: wa2 }).is_empty());
        assert_eq!(
            h.dispatch(b, ControlMessage::Focus { window: wb }),
            vec![
                RegistryEffect::SetPriority {
                    pid: ProcessId(1),
                    priority: Priority::Background
                },
                RegistryEffect::SetPriority {
                    pid: ProcessId(2),
                    priority: Priority::Active
                },
            ]
        );
        assert_eq!(h.registry.focused(), Some(wb));
    }

    #[test]
    fn resize_round_trip_updates_routing() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (window, old) = h.open_window(conn, &peer, WindowKind::Card);
        h.dispatch(
            conn,
            ControlMessage::ResizeRequest {
                window,
                width: 128,
                height: 32,
            },
        );
        let Some(PeerMessage::ResizeReply { key: new, .. }) = peer.take().pop() else {
            panic!("expected resize reply");
        };
        h.dispatch(conn, ControlMessage::ResizeAck { window, key: new });
        let c = h.registry.connection(conn).unwrap();
        assert_eq!(c.route(new), Some(window));
        assert_eq!(c.route(old), None);
        assert_eq!(
            peer.take(),
            vec![
                PeerMessage::Resized {
                    window,
                    key: new,
                    width: 128,
                    height: 32
                },
                PeerMessage::Repaint { window },
            ]
        );
    }

    #[test]
    fn routed_payload_reaches_owner() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (window, key) = h.open_window(conn, &peer, WindowKind::Card);
        h.dispatch(
            conn,
            ControlMessage::Routed {
                key,
                payload: serde_json::json!({"x": 1}),
            },
        );
        h.dispatch(
            conn,
            ControlMessage::Routed {
                key: BufferKey(999),
                payload: serde_json::json!(null),
            },
        );
        let delivered: Vec<_> = h
            .presentation
            .events()
            .into_iter()
            .filter(|e| matches!(e, PresentationEvent::Delivered(..)))
            .collect();
        assert_eq!(
            delivered,
            vec![PresentationEvent::Delivered(window, r#"{"x":1}"#.into())]
        );
    }

    #[test]
    fn two_phase_teardown() {
        let mut h = Harness::new();
        let (conn, peer) = h.connect(10);
        let (window, _) = h.open_window(conn, &peer, WindowKind::Card);
        h.dispatch(
            conn,
            ControlMessage::ResizeRequest {
                window,
                width: 10,
                height: 10,
            },
        );

        let pid = {
            let mut cx = DispatchContext {
                negotiator: &mut h.negotiator,
                presentation: &mut h.sink,
                now_ms: 0,
            };
            let pid = h.registry.mark_for_removal(conn, &mut cx);
            assert!(h.registry.mark_for_removal(conn, &mut cx).is_none());
            pid
        };
        assert_eq!(pid, Some(ProcessId(10)));
        assert!(h.registry.window(window).is_none());
        assert_eq!(h.negotiator.live_regions(), 0);
        assert!(h.registry.connection(conn).is_some());

        // Marked connections ignore traffic.
        assert!(h
            .dispatch(
                conn,
                ControlMessage::PrepareWindow {
                    width: 1,
                    height: 1,
                    has_alpha: false,
                    kind: WindowKind::Card
                }
            )
            .is_empty());
        assert_eq!(h.negotiator.live_regions(), 0);

        assert_eq!(h.registry.sweep(), vec![(conn, ProcessId(10))]);
        assert!(h.registry.connection(conn).is_none());
        assert!(h.registry.connection_for_pid(ProcessId(10)).is_none());
        assert!(h.registry.sweep().is_empty());
    }

    #[test]
    fn window_kind_serde() {
        let kind: WindowKind = serde_json::from_str("\"banner\"").unwrap();
        assert!(kind.is_nuke_exempt());
        assert!(!WindowKind::Popup.is_nuke_exempt());
    }
}
