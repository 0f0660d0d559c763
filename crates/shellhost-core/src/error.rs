//! Error types for shellhost-core

use std::fmt::Write;
use std::path::PathBuf;
use thiserror::Error;

use crate::ids::{BufferKey, WindowId};
use crate::memory_pressure::MemoryState;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shellhost-core
#[derive(Error, Debug)]
pub enum Error {
    /// Fork/exec or sandbox setup failed
    #[error("Launch failed: {0}")]
    Launch(#[from] LaunchError),

    /// Launch refused before any process was created
    #[error("Launch denied: {0}")]
    Admission(#[from] AdmissionDenied),

    /// Buffer negotiation failed; the window keeps its previous buffer
    #[error("Buffer negotiation failed: {0}")]
    Buffer(#[from] BufferError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (channel failures, unknown connections, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Launch(err) => Some(err.remediation()),
            Self::Admission(err) => Some(err.remediation()),
            Self::Buffer(_) => None,
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the socket directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Each IPC message must be a single JSON object per line."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Restart the broker or retry the operation.")
                    .command("Check config", "shellhostd check-config"),
            ),
        }
    }
}

/// Process creation failures. Reported once; never retried automatically.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("executable not found for {app_id}: {path}")]
    ExecutableNotFound { app_id: String, path: PathBuf },

    #[error("failed to spawn {app_id}: {reason}")]
    SpawnFailed { app_id: String, reason: String },

    #[error("sandbox setup failed for {app_id}: {reason}")]
    SandboxSetup { app_id: String, reason: String },
}

impl LaunchError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ExecutableNotFound { path, .. } => {
                Remediation::new(format!("Install the application binary at {}.", path.display()))
                    .command("Check path", format!("ls -la {}", path.display()))
            }
            Self::SpawnFailed { .. } => {
                Remediation::new("The OS refused to create the process. Check limits and retry.")
                    .command("Process limits", "ulimit -u")
                    .alternative("Close other applications to free process slots.")
            }
            Self::SandboxSetup { .. } => Remediation::new(
                "Sandbox wrapper could not be prepared. Verify the [supervisor.sandbox] config.",
            )
            .command("Check config", "shellhostd check-config"),
        }
    }
}

/// Typed reason a launch was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdmissionDenied {
    #[error("memory pressure is {state}")]
    MemoryPressure { state: MemoryState },

    #[error("requires {required_mb} MB but only {headroom_mb} MB headroom remains")]
    InsufficientHeadroom { required_mb: u64, headroom_mb: u64 },

    #[error("process limit of {limit} reached")]
    TooManyProcesses { limit: usize },

    #[error("{app_id} is shutting down")]
    ShuttingDown { app_id: String },
}

impl AdmissionDenied {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MemoryPressure { .. } | Self::InsufficientHeadroom { .. } => {
                Remediation::new("Close some applications to free memory, then launch again.")
            }
            Self::TooManyProcesses { limit } => Remediation::new(format!(
                "At most {limit} applications may run at once. Close one and retry."
            ))
            .alternative("Raise supervisor.max_processes in the config."),
            Self::ShuttingDown { .. } => {
                Remediation::new("Wait for the application to finish closing and retry.")
            }
        }
    }
}

/// Buffer negotiation failures. The window keeps its prior buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("unknown window {0}")]
    UnknownWindow(WindowId),

    #[error("window {0} has no bound buffer")]
    NotBound(WindowId),

    #[error("window {window} already has a buffer")]
    AlreadyBound { window: WindowId },

    #[error("window {0} already has a resize in flight")]
    AlreadyResizing(WindowId),

    #[error("invalid key {key} for window {window}")]
    InvalidKey { window: WindowId, key: BufferKey },

    #[error("flip {from_w}x{from_h} -> {to_w}x{to_h} is not a transpose")]
    NotTranspose {
        from_w: u32,
        from_h: u32,
        to_w: u32,
        to_h: u32,
    },

    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("resize of window {0} timed out")]
    Timeout(WindowId),

    #[error("allocation of {0} bytes failed")]
    AllocationFailed(usize),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid config value: {0}")]
    ValidationError(String),

    #[error("failed to serialize config: {0}")]
    SerializeFailed(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::ReadFailed { path, .. } => {
                Remediation::new(format!("Make sure {} exists and is readable.", path.display()))
                    .command("Check file", format!("ls -la {}", path.display()))
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax error and retry.")
                .command("Validate", "shellhostd check-config"),
            Self::ValidationError(_) => {
                Remediation::new("Adjust the offending value; thresholds must be ascending.")
                    .command("Validate", "shellhostd check-config")
            }
            Self::SerializeFailed(_) => Remediation::new("Report the config that failed to render.")
                .command("Defaults", "shellhostd print-config --defaults"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_denied_display() {
        let err = AdmissionDenied::InsufficientHeadroom {
            required_mb: 120,
            headroom_mb: 40,
        };
        assert_eq!(
            err.to_string(),
            "requires 120 MB but only 40 MB headroom remains"
        );
        let err = AdmissionDenied::MemoryPressure {
            state: MemoryState::Low,
        };
        assert_eq!(err.to_string(), "memory pressure is low");
    }

    #[test]
    fn error_wraps_admission() {
        let err: Error = AdmissionDenied::TooManyProcesses { limit: 8 }.into();
        assert!(err.to_string().contains("process limit of 8 reached"));
        assert!(err.remediation().is_some());
    }

    #[test]
    fn buffer_errors_have_no_remediation() {
        let err: Error = BufferError::Timeout(WindowId(3)).into();
        assert!(err.remediation().is_none());
        assert_eq!(
            err.to_string(),
            "Buffer negotiation failed: resize of window win-3 timed out"
        );
    }

    #[test]
    fn remediation_renders_sections() {
        let text = Remediation::new("Do the thing")
            .command("Check", "ls")
            .alternative("Or not")
            .render_plain();
        assert!(text.contains("To fix:"));
        assert!(text.contains("- Check: ls"));
        assert!(text.contains("- Or not"));
    }

    #[test]
    fn launch_error_remediation_mentions_path() {
        let err = LaunchError::ExecutableNotFound {
            app_id: "com.example.mail".into(),
            path: PathBuf::from("/apps/mail/bin"),
        };
        assert!(err.remediation().summary.contains("/apps/mail/bin"));
    }
}
