//! Startup completion state machine.
//!
//! `Uninitialized -> WaitingForIdle -> WaitingForLauncherReady -> Finished`.
//! The event loop is considered settled after a run of closely spaced idle
//! callbacks; boot then finishes when the launcher reports ready or a
//! timeout expires, whichever comes first. `Finished` is terminal and is
//! reported exactly once.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Boot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    /// Idle callbacks must arrive closer together than this.
    pub idle_spacing_ms: u64,
    /// Consecutive closely spaced idle callbacks required.
    pub idle_callbacks_required: u32,
    /// How long to wait for the launcher before finishing anyway.
    pub launcher_timeout_ms: u64,
    /// No launcher will ever report; finish as soon as idle.
    pub minimal_ui: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            idle_spacing_ms: 5,
            idle_callbacks_required: 3,
            launcher_timeout_ms: 60_000,
            minimal_ui: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootState {
    #[default]
    Uninitialized,
    WaitingForIdle,
    WaitingForLauncherReady,
    Finished,
}

impl std::fmt::Display for BootState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::WaitingForIdle => write!(f, "waiting_for_idle"),
            Self::WaitingForLauncherReady => write!(f, "waiting_for_launcher_ready"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// State change reported to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootTransition {
    WaitingForIdle,
    /// Arm the launcher timeout.
    WaitingForLauncher { deadline_ms: u64 },
    Finished,
}

#[derive(Debug, Default)]
pub struct BootSequencer {
    config: BootConfig,
    state: BootState,
    idle_count: u32,
    last_idle_ms: Option<u64>,
    launcher_ready: bool,
    deadline_ms: Option<u64>,
}

impl BootSequencer {
    #[must_use]
    pub fn new(config: BootConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn state(&self) -> BootState {
        self.state
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state == BootState::Finished
    }

    /// Armed launcher deadline.
    #[must_use]
    pub fn deadline(&self) -> Option<u64> {
        self.deadline_ms
    }

    pub fn start(&mut self) -> Option<BootTransition> {
        if self.state != BootState::Uninitialized {
            return None;
        }
        self.state = BootState::WaitingForIdle;
        debug!("boot waiting for idle");
        Some(BootTransition::WaitingForIdle)
    }

    /// One idle callback from the event loop.
    pub fn on_idle(&mut self, now_ms: u64) -> Option<BootTransition> {
        if self.state != BootState::WaitingForIdle {
            return None;
        }
        let close = self
            .last_idle_ms
            .is_some_and(|last| now_ms.saturating_sub(last) < self.config.idle_spacing_ms);
        self.idle_count = if close { self.idle_count + 1 } else { 1 };
        self.last_idle_ms = Some(now_ms);

        if self.idle_count < self.config.idle_callbacks_required {
            return None;
        }
        self.state = BootState::WaitingForLauncherReady;
        if self.launcher_ready || self.config.minimal_ui {
            return Some(self.finish("launcher already ready"));
        }
        let deadline_ms = now_ms.saturating_add(self.config.launcher_timeout_ms);
        self.deadline_ms = Some(deadline_ms);
        debug!(deadline_ms, "boot waiting for launcher");
        Some(BootTransition::WaitingForLauncher { deadline_ms })
    }

    /// The launcher reported ready. Remembered if it arrives early.
    pub fn launcher_ready(&mut self) -> Option<BootTransition> {
        self.launcher_ready = true;
        if self.state == BootState::WaitingForLauncherReady {
            Some(self.finish("launcher ready"))
        } else {
            None
        }
    }

    /// The launcher deadline elapsed.
    pub fn timeout_fired(&mut self, now_ms: u64) -> Option<BootTransition> {
        match (self.state, self.deadline_ms) {
            (BootState::WaitingForLauncherReady, Some(deadline)) if deadline <= now_ms => {
                warn!("launcher never reported ready; finishing boot on timeout");
                Some(self.finish("timeout"))
            }
            _ => None,
        }
    }

    fn finish(&mut self, reason: &str) -> BootTransition {
        self.state = BootState::Finished;
        self.deadline_ms = None;
        info!(reason, "boot finished");
        BootTransition::Finished
    }
}
