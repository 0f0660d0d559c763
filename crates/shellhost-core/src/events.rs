//! Outbound collaborator interfaces: the presentation layer and the user
//! notice channel.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::connection::WindowKind;
use crate::error::AdmissionDenied;
use crate::ids::{BufferKey, WindowId};
use crate::memory_pressure::MemoryState;

/// Window lifecycle callbacks consumed by the UI layer.
pub trait PresentationSink: Send {
    fn add_window(&mut self, window: WindowId, kind: WindowKind, app_id: &str);
    fn remove_window(&mut self, window: WindowId);
    fn focus_window(&mut self, window: WindowId);
    fn boot_finished(&mut self);
    fn repaint(&mut self, window: WindowId, key: BufferKey);
    /// Opaque payload routed to a window by buffer key.
    fn deliver(&mut self, _window: WindowId, _payload: &serde_json::Value) {}
}

/// Messages shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum UserNotice {
    LaunchDenied {
        app_id: String,
        reason: AdmissionDenied,
    },
    LaunchFailed {
        app_id: String,
        reason: String,
    },
    ForcedClose {
        app_id: String,
    },
    MemoryStateChanged {
        state: MemoryState,
    },
}

impl std::fmt::Display for UserNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LaunchDenied { app_id, reason } => {
                write!(f, "{app_id} could not be opened: {reason}")
            }
            Self::LaunchFailed { app_id, reason } => {
                write!(f, "{app_id} failed to start: {reason}")
            }
            Self::ForcedClose { app_id } => write!(f, "{app_id} was closed to free memory"),
            Self::MemoryStateChanged { state } => write!(f, "memory is {state}"),
        }
    }
}

/// One-way channel for [`UserNotice`]s.
pub trait NoticeSink: Send {
    fn notify(&mut self, notice: UserNotice);
}

// =============================================================================
// Logging sinks
// =============================================================================

/// Presentation sink that only logs; used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresentation;

impl PresentationSink for LogPresentation {
    fn add_window(&mut self, window: WindowId, kind: WindowKind, app_id: &str) {
        info!(window_id = %window, %kind, app_id, "window added");
    }

    fn remove_window(&mut self, window: WindowId) {
        info!(window_id = %window, "window removed");
    }

    fn focus_window(&mut self, window: WindowId) {
        info!(window_id = %window, "window focused");
    }

    fn boot_finished(&mut self) {
        info!("boot finished");
    }

    fn repaint(&mut self, window: WindowId, key: BufferKey) {
        tracing::debug!(window_id = %window, %key, "repaint requested");
    }
}

/// Notice sink writing to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotices;

impl NoticeSink for LogNotices {
    fn notify(&mut self, notice: UserNotice) {
        info!(%notice, "user notice");
    }
}

// =============================================================================
// Recording sinks
// =============================================================================

/// Call recorded by [`RecordingPresentation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationEvent {
    Added {
        window: WindowId,
        kind: WindowKind,
        app_id: String,
    },
    Removed(WindowId),
    Focused(WindowId),
    BootFinished,
    Repaint(WindowId, BufferKey),
    Delivered(WindowId, String),
}

/// Presentation sink recording every call. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingPresentation {
    events: Arc<Mutex<Vec<PresentationEvent>>>,
}

impl RecordingPresentation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<PresentationEvent> {
        self.events.lock().clone()
    }

    #[must_use]
    pub fn boot_finished_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| **e == PresentationEvent::BootFinished)
            .count()
    }

    fn push(&self, event: PresentationEvent) {
        self.events.lock().push(event);
    }
}

impl PresentationSink for RecordingPresentation {
    fn add_window(&mut self, window: WindowId, kind: WindowKind, app_id: &str) {
        self.push(PresentationEvent::Added {
            window,
            kind,
            app_id: app_id.to_string(),
        });
    }

    fn remove_window(&mut self, window: WindowId) {
        self.push(PresentationEvent::Removed(window));
    }

    fn focus_window(&mut self, window: WindowId) {
        self.push(PresentationEvent::Focused(window));
    }

    fn boot_finished(&mut self) {
        self.push(PresentationEvent::BootFinished);
    }

    fn repaint(&mut self, window: WindowId, key: BufferKey) {
        self.push(PresentationEvent::Repaint(window, key));
    }

    fn deliver(&mut self, window: WindowId, payload: &serde_json::Value) {
        self.push(PresentationEvent::Delivered(window, payload.to_string()));
    }
}

/// Notice sink recording every notice. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotices {
    notices: Arc<Mutex<Vec<UserNotice>>>,
}

impl RecordingNotices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn notices(&self) -> Vec<UserNotice> {
        self.notices.lock().clone()
    }
}

impl NoticeSink for RecordingNotices {
    fn notify(&mut self, notice: UserNotice) {
        self.notices.lock().push(notice);
    }
}
