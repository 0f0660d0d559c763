//! Shell control socket.
//!
//! The launcher and other shell-side clients drive the broker over a second
//! Unix socket, separate from the one applications connect to. Every request
//! line gets exactly one reply line. The socket is created owner-only and a
//! peer whose uid differs from the socket owner is turned away.

use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::BrokerEvent;
use crate::ids::{ProcessId, WindowId};
use crate::ipc::{IpcError, bind_socket, encode_line, line_reader, next_line, remove_socket};
use crate::spawn::AppType;
use crate::supervisor::{LaunchOutcome, LaunchRequest};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Request from the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellRequest {
    Launch {
        app_id: String,
        path: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        app_type: AppType,
        #[serde(default)]
        required_memory_mb: u64,
        #[serde(default)]
        quota_mb: Option<u64>,
    },
    /// The launcher finished drawing; boot may complete.
    LauncherReady,
    /// The user closed a window.
    CloseWindow { window: WindowId },
    /// Close every window of an app, parking it when policy allows.
    CloseApp { app_id: String },
    SetCaching { enabled: bool },
}

impl ShellRequest {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "launch",
            Self::LauncherReady => "launcher_ready",
            Self::CloseWindow { .. } => "close_window",
            Self::CloseApp { .. } => "close_app",
            Self::SetCaching { .. } => "set_caching",
        }
    }
}

/// Reply to one [`ShellRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShellReply {
    Launched {
        pid: ProcessId,
        brought_to_front: bool,
    },
    /// Admission refused or the spawn failed.
    Refused { reason: String },
    Ok,
    Error { message: String },
}

impl From<LaunchOutcome> for ShellReply {
    fn from(outcome: LaunchOutcome) -> Self {
        Self::Launched {
            pid: outcome.pid(),
            brought_to_front: matches!(outcome, LaunchOutcome::BroughtToFront(_)),
        }
    }
}

/// Owner-only Unix socket accepting [`ShellRequest`] lines.
pub struct ControlListener {
    socket_path: PathBuf,
    listener: UnixListener,
    max_line_bytes: usize,
    owner_uid: u32,
}

impl ControlListener {
    /// Bind and restrict the socket to its owner.
    pub fn bind(socket_path: PathBuf, max_line_bytes: usize) -> Result<Self, IpcError> {
        let listener = bind_socket(&socket_path)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        let owner_uid = std::fs::metadata(&socket_path)?.uid();
        info!(path = %socket_path.display(), owner_uid, "control listener bound");
        Ok(Self {
            socket_path,
            listener,
            max_line_bytes,
            owner_uid,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accept shell clients until `shutdown_flag` is set.
    pub async fn run(
        self,
        events: mpsc::UnboundedSender<BrokerEvent>,
        shutdown_flag: Arc<AtomicBool>,
    ) {
        while !shutdown_flag.load(Ordering::SeqCst) {
            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    let tx = events.clone();
                    let max = self.max_line_bytes;
                    let owner = self.owner_uid;
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, tx, max, owner).await {
                            debug!(error = %err, "control connection closed with error");
                        }
                    });
                }
                Ok(Err(err)) => {
                    warn!(error = %err, path = %self.socket_path.display(), "control accept failed");
                }
                Err(_) => {}
            }
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        remove_socket(&self.socket_path);
    }
}

async fn handle_client(
    stream: UnixStream,
    events: mpsc::UnboundedSender<BrokerEvent>,
    max_line_bytes: usize,
    owner_uid: u32,
) -> Result<(), std::io::Error> {
    let peer_uid = stream.peer_cred()?.uid();
    let (read_half, mut write_half) = stream.into_split();
    if peer_uid != owner_uid {
        warn!(peer_uid, owner_uid, "control client runs as another user; closing");
        let reply = ShellReply::Error {
            message: "permission denied".to_string(),
        };
        write_reply(&mut write_half, &reply).await?;
        return Ok(());
    }

    let mut lines = line_reader(read_half, max_line_bytes);
    while let Some(line) = next_line(&mut lines).await? {
        let reply = match serde_json::from_str::<ShellRequest>(&line) {
            Ok(request) => {
                debug!(kind = request.kind(), "control request");
                serve(request, &events).await
            }
            Err(err) => ShellReply::Error {
                message: format!("invalid request: {err}"),
            },
        };
        write_reply(&mut write_half, &reply).await?;
    }
    Ok(())
}

async fn write_reply<W: AsyncWrite + Unpin>(
    write_half: &mut W,
    reply: &ShellReply,
) -> Result<(), std::io::Error> {
    let line = encode_line(reply).map_err(std::io::Error::other)?;
    write_half.write_all(line.as_bytes()).await
}

fn broker_gone() -> ShellReply {
    ShellReply::Error {
        message: "broker is shutting down".to_string(),
    }
}

/// Post one request to the broker and wait for its answer where it has one.
async fn serve(request: ShellRequest, events: &mpsc::UnboundedSender<BrokerEvent>) -> ShellReply {
    match request {
        ShellRequest::Launch {
            app_id,
            path,
            args,
            app_type,
            required_memory_mb,
            quota_mb,
        } => {
            let request = LaunchRequest::new(app_id, path, app_type)
                .with_args(args)
                .with_memory(required_memory_mb, quota_mb);
            let (tx, rx) = oneshot::channel();
            if events
                .send(BrokerEvent::Launch {
                    request,
                    reply: Some(tx),
                })
                .is_err()
            {
                return broker_gone();
            }
            match rx.await {
                Ok(Ok(outcome)) => outcome.into(),
                Ok(Err(err)) => ShellReply::Refused {
                    reason: err.to_string(),
                },
                Err(_) => broker_gone(),
            }
        }
        ShellRequest::CloseWindow { window } => {
            let (tx, rx) = oneshot::channel();
            if events
                .send(BrokerEvent::CloseWindow {
                    window,
                    reply: Some(tx),
                })
                .is_err()
            {
                return broker_gone();
            }
            match rx.await {
                Ok(true) => ShellReply::Ok,
                Ok(false) => ShellReply::Error {
                    message: format!("unknown window {window}"),
                },
                Err(_) => broker_gone(),
            }
        }
        ShellRequest::CloseApp { app_id } => {
            let (tx, rx) = oneshot::channel();
            if events
                .send(BrokerEvent::CloseApp {
                    app_id: app_id.clone(),
                    reply: Some(tx),
                })
                .is_err()
            {
                return broker_gone();
            }
            match rx.await {
                Ok(true) => ShellReply::Ok,
                Ok(false) => ShellReply::Error {
                    message: format!("{app_id} is not running"),
                },
                Err(_) => broker_gone(),
            }
        }
        ShellRequest::LauncherReady => post(events, BrokerEvent::LauncherReady),
        ShellRequest::SetCaching { enabled } => post(events, BrokerEvent::SetCaching(enabled)),
    }
}

fn post(events: &mpsc::UnboundedSender<BrokerEvent>, event: BrokerEvent) -> ShellReply {
    if events.send(event).is_ok() {
        ShellReply::Ok
    } else {
        broker_gone()
    }
}
