//! Broker ↔ application message channel.
//!
//! Applications connect over a Unix domain socket and exchange
//! newline-delimited JSON. The first line must be a [`ControlMessage::Hello`]
//! naming the process, and that pid must match the peer credentials of the
//! socket. Every later line is forwarded to the broker as
//! [`BrokerEvent::Inbound`] in arrival order. Outbound [`PeerMessage`]s are
//! written by a per-connection task so the event loop never blocks on a slow
//! peer. Lines are framed by [`BoundedLines`], which never buffers more than
//! `max_line_bytes` of a single line.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
#[cfg(unix)]
use std::os::unix::net::UnixStream as StdUnixStream;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use crate::broker::BrokerEvent;
use crate::connection::WindowKind;
use crate::ids::{BufferKey, ConnectionId, ProcessId, WindowId};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(250);

// =============================================================================
// Messages
// =============================================================================

/// Message sent by an application to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First message on every connection. `pid` must be the sender's own.
    Hello {
        pid: ProcessId,
        app_id: String,
        /// App id of the instance that pushed this one as a child scene.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    },
    /// The application finished loading.
    Loaded,
    PrepareWindow {
        width: u32,
        height: u32,
        #[serde(default)]
        has_alpha: bool,
        #[serde(default)]
        kind: WindowKind,
    },
    AddWindow { window: WindowId },
    RemoveWindow { window: WindowId },
    SetProperties {
        window: WindowId,
        properties: BTreeMap<String, String>,
    },
    Focus { window: WindowId },
    Unfocus { window: WindowId },
    /// Synchronous: answered with `ResizeReply` or `ResizeFailed`.
    ResizeRequest {
        window: WindowId,
        width: u32,
        height: u32,
    },
    /// The peer adopted the key from `ResizeReply`.
    ResizeAck { window: WindowId, key: BufferKey },
    /// Asynchronous: answered with `FlipAck`.
    FlipRequest {
        window: WindowId,
        width: u32,
        height: u32,
    },
    /// The peer closed a window the broker asked it to close.
    CloseAck { window: WindowId },
    /// Opaque payload for the window owning `key`.
    Routed {
        key: BufferKey,
        payload: serde_json::Value,
    },
}

impl ControlMessage {
    /// Short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Loaded => "loaded",
            Self::PrepareWindow { .. } => "prepare_window",
            Self::AddWindow { .. } => "add_window",
            Self::RemoveWindow { .. } => "remove_window",
            Self::SetProperties { .. } => "set_properties",
            Self::Focus { .. } => "focus",
            Self::Unfocus { .. } => "unfocus",
            Self::ResizeRequest { .. } => "resize_request",
            Self::ResizeAck { .. } => "resize_ack",
            Self::FlipRequest { .. } => "flip_request",
            Self::CloseAck { .. } => "close_ack",
            Self::Routed { .. } => "routed",
        }
    }
}

/// Message sent by the broker to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMessage {
    Prepared {
        window: WindowId,
        key: BufferKey,
        metadata_key: BufferKey,
    },
    ResizeReply { window: WindowId, key: BufferKey },
    Resized {
        window: WindowId,
        key: BufferKey,
        width: u32,
        height: u32,
    },
    /// The resize was abandoned; `key` is the buffer the window still owns.
    ResizeFailed {
        window: WindowId,
        key: Option<BufferKey>,
        reason: String,
    },
    FlipAck {
        window: WindowId,
        width: u32,
        height: u32,
    },
    Close { window: WindowId, keep_alive: bool },
    Repaint { window: WindowId },
    Focus { window: WindowId, focused: bool },
    Error { message: String },
}

/// Outbound half of a connection.
pub trait PeerSink: Send {
    /// Queue a message. Returns `false` once the peer is gone.
    fn send(&mut self, message: PeerMessage) -> bool;
}

/// Peer backed by a channel drained by a writer task.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    tx: mpsc::UnboundedSender<PeerMessage>,
}

impl ChannelPeer {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<PeerMessage>) -> Self {
        Self { tx }
    }

    /// A peer plus the receiver its messages arrive on.
    #[must_use]
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<PeerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PeerSink for ChannelPeer {
    fn send(&mut self, message: PeerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Peer recording everything sent to it. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingPeer {
    sent: Arc<Mutex<Vec<PeerMessage>>>,
}

impl RecordingPeer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn sent(&self) -> Vec<PeerMessage> {
        self.sent.lock().clone()
    }

    /// Remove and return everything recorded so far.
    #[must_use]
    pub fn take(&self) -> Vec<PeerMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl PeerSink for RecordingPeer {
    fn send(&mut self, message: PeerMessage) -> bool {
        self.sent.lock().push(message);
        true
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Application socket path; `None` resolves to the runtime directory.
    pub socket_path: Option<PathBuf>,
    /// Shell control socket path; `None` resolves to the runtime directory.
    pub control_socket_path: Option<PathBuf>,
    /// Lines longer than this are dropped.
    pub max_line_bytes: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            control_socket_path: None,
            max_line_bytes: 512 * 1024,
        }
    }
}

impl IpcConfig {
    /// Configured socket path, else `<runtime dir>/shellhost/broker.sock`.
    #[must_use]
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| runtime_socket("broker.sock"))
    }

    /// Configured control path, else `<runtime dir>/shellhost/control.sock`.
    #[must_use]
    pub fn resolved_control_socket_path(&self) -> PathBuf {
        self.control_socket_path
            .clone()
            .unwrap_or_else(|| runtime_socket("control.sock"))
    }
}

fn runtime_socket(name: &str) -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("shellhost")
        .join(name)
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("socket path is empty")]
    EmptySocketPath,
    #[error("socket path already exists: {0}")]
    SocketAlreadyExists(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Listener
// =============================================================================

/// Unix socket listener feeding the broker's event channel.
pub struct IpcListener {
    socket_path: PathBuf,
    listener: UnixListener,
    max_line_bytes: usize,
}

impl IpcListener {
    /// Bind, replacing a stale socket left by a previous run.
    pub fn bind(socket_path: PathBuf, max_line_bytes: usize) -> Result<Self, IpcError> {
        let listener = bind_socket(&socket_path)?;
        info!(path = %socket_path.display(), "ipc listener bound");
        Ok(Self {
            socket_path,
            listener,
            max_line_bytes,
        })
    }

    #[must_use]
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accept connections until `shutdown_flag` is set.
    pub async fn run(
        self,
        events: mpsc::UnboundedSender<BrokerEvent>,
        shutdown_flag: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown_flag.load(Ordering::SeqCst) {
                break;
            }

            match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                Ok(Ok((stream, _addr))) => {
                    let tx = events.clone();
                    let max = self.max_line_bytes;
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, tx, max).await {
                            debug!(error = %err, "ipc connection closed with error");
                        }
                    });
                }
                Ok(Err(err)) => {
                    warn!(error = %err, path = %self.socket_path.display(), "ipc accept failed");
                }
                Err(_) => {} // timeout, loop to check shutdown flag
            }
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        remove_socket(&self.socket_path);
    }
}

/// Bind a Unix listener at `socket_path`, creating its directory and
/// removing a stale socket nobody answers on.
pub(crate) fn bind_socket(socket_path: &Path) -> Result<UnixListener, IpcError> {
    if socket_path.as_os_str().is_empty() {
        return Err(IpcError::EmptySocketPath);
    }
    maybe_cleanup_stale_socket(socket_path)?;
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(UnixListener::bind(socket_path)?)
}

/// Remove the socket file, ignoring a missing one.
pub(crate) fn remove_socket(socket_path: &Path) {
    if let Err(err) = std::fs::remove_file(socket_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            debug!(
                error = %err,
                path = %socket_path.display(),
                "failed to remove socket path on drop"
            );
        }
    }
}

fn maybe_cleanup_stale_socket(socket_path: &Path) -> Result<(), IpcError> {
    let metadata = match std::fs::symlink_metadata(socket_path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(IpcError::Io(err)),
    };

    #[cfg(unix)]
    let is_socket = metadata.file_type().is_socket();
    #[cfg(not(unix))]
    let is_socket = false;

    if !is_socket {
        return Err(IpcError::SocketAlreadyExists(
            socket_path.display().to_string(),
        ));
    }

    #[cfg(unix)]
    match StdUnixStream::connect(socket_path) {
        Ok(_stream) => Err(IpcError::SocketAlreadyExists(
            socket_path.display().to_string(),
        )),
        Err(err)
            if matches!(
                err.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound
            ) =>
        {
            std::fs::remove_file(socket_path)?;
            debug!(path = %socket_path.display(), "removed stale ipc socket before bind");
            Ok(())
        }
        Err(err) => Err(IpcError::Io(err)),
    }

    #[cfg(not(unix))]
    {
        Err(IpcError::SocketAlreadyExists(
            socket_path.display().to_string(),
        ))
    }
}

/// Decode one inbound line.
pub fn decode_line(line: &str) -> Result<ControlMessage, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encode one outbound line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

// =============================================================================
// Framing
// =============================================================================

/// One frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// A line longer than the limit; its bytes were discarded as they arrived.
    Oversized,
}

/// Newline framing with a hard per-line limit.
///
/// Wraps [`LinesCodec`] so an oversized line surfaces as [`Frame::Oversized`]
/// instead of a stream error, and the lines buffered behind it keep flowing.
#[derive(Debug, Clone)]
pub struct BoundedLines {
    inner: LinesCodec,
}

impl BoundedLines {
    #[must_use]
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn lift(result: Result<Option<String>, LinesCodecError>) -> Result<Option<Frame>, std::io::Error> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(LinesCodecError::Io(err)) => Err(err),
        }
    }
}

impl Decoder for BoundedLines {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
        Self::lift(self.inner.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
        Self::lift(self.inner.decode_eof(buf))
    }
}

pub(crate) type LineReader<R> = FramedRead<R, BoundedLines>;

pub(crate) fn line_reader<R: AsyncRead>(read: R, max_line_bytes: usize) -> LineReader<R> {
    FramedRead::new(read, BoundedLines::new(max_line_bytes))
}

/// Next complete line, skipping oversized ones. `None` on EOF.
pub(crate) async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut LineReader<R>,
) -> Result<Option<String>, std::io::Error> {
    while let Some(frame) = lines.next().await {
        match frame? {
            Frame::Line(line) => return Ok(Some(line)),
            Frame::Oversized => warn!("ipc line too large; dropping"),
        }
    }
    Ok(None)
}

// =============================================================================
// Connections
// =============================================================================

/// Pid of the process on the other end of `stream`, from the kernel.
fn peer_pid(stream: &UnixStream) -> Result<Option<ProcessId>, std::io::Error> {
    let cred = stream.peer_cred()?;
    Ok(cred.pid().and_then(|pid| u32::try_from(pid).ok()).map(ProcessId))
}

async fn write_lines<W, T>(write_half: &mut W, messages: impl IntoIterator<Item = T>)
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    for message in messages {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound message");
                continue;
            }
        };
        if write_half.write_all(line.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    events: mpsc::UnboundedSender<BrokerEvent>,
    max_line_bytes: usize,
) -> Result<(), std::io::Error> {
    let actual_pid = peer_pid(&stream)?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = line_reader(read_half, max_line_bytes);

    // Handshake: the first line names the process.
    let (pid, app_id, parent) = loop {
        let Some(line) = next_line(&mut lines).await? else {
            return Ok(());
        };
        match decode_line(&line) {
            Ok(ControlMessage::Hello {
                pid,
                app_id,
                parent,
            }) => break (pid, app_id, parent),
            Ok(other) => {
                warn!(kind = other.kind(), "ipc connection did not start with hello; closing");
                return Ok(());
            }
            Err(err) => debug!(error = %err, "failed to decode ipc hello"),
        }
    };

    if let Some(actual) = actual_pid {
        if actual != pid {
            warn!(claimed = %pid, %actual, %app_id, "hello pid does not match peer; closing");
            let refusal = PeerMessage::Error {
                message: format!("hello names pid {pid} but the peer is pid {actual}"),
            };
            write_lines(&mut write_half, [refusal]).await;
            return Ok(());
        }
    }

    let (peer, mut outbound) = ChannelPeer::pair();
    let (reply_tx, reply_rx) = oneshot::channel();
    if events
        .send(BrokerEvent::Connected {
            pid,
            app_id,
            parent,
            peer: Box::new(peer),
            reply: Some(reply_tx),
        })
        .is_err()
    {
        return Ok(());
    }
    let Ok(conn) = reply_rx.await else {
        // Refused; deliver whatever the broker queued before hanging up.
        let mut queued = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            queued.push(message);
        }
        write_lines(&mut write_half, queued).await;
        return Ok(());
    };

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "failed to encode peer message");
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let result = read_inbound(conn, &mut lines, &events).await;
    let _ = events.send(BrokerEvent::Disconnected { conn });
    writer.abort();
    result
}

async fn read_inbound(
    conn: ConnectionId,
    lines: &mut LineReader<OwnedReadHalf>,
    events: &mpsc::UnboundedSender<BrokerEvent>,
) -> Result<(), std::io::Error> {
    while let Some(line) = next_line(lines).await? {
        match decode_line(&line) {
            Ok(msg) => {
                if events.send(BrokerEvent::Inbound { conn, msg }).is_err() {
                    break;
                }
            }
            Err(err) => debug!(%conn, error = %err, "failed to decode ipc line"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn decode_prepare_window_defaults() {
        let msg = decode_line(r#"{"type":"prepare_window","width":320,"height":480}"#).unwrap();
        assert_eq!(
            msg,
            ControlMessage::PrepareWindow {
                width: 320,
                height: 480,
                has_alpha: false,
                kind: WindowKind::Card
            }
        );
    }

    #[test]
    fn decode_hello_with_and_without_parent() {
        assert_eq!(
            decode_line(r#"{"type":"hello","pid":7,"app_id":"com.example.mail"}"#).unwrap(),
            ControlMessage::Hello {
                pid: ProcessId(7),
                app_id: "com.example.mail".into(),
                parent: None,
            }
        );
        let child = decode_line(
            r#"{"type":"hello","pid":8,"app_id":"com.example.picker","parent":"com.example.mail"}"#,
        )
        .unwrap();
        assert!(matches!(
            child,
            ControlMessage::Hello { parent: Some(ref p), .. } if p == "com.example.mail"
        ));
    }

    #[test]
    fn bounded_lines_discards_oversized_without_buffering() {
        let mut codec = BoundedLines::new(16);
        let mut buf = BytesMut::from(&b"x".repeat(64)[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Frame::Oversized));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.is_empty());

        // The tail of the long line is skipped; the next line decodes.
        buf.extend_from_slice(b"yyyy\n{\"type\":\"loaded\"}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Line(r#"{"type":"loaded"}"#.to_string()))
        );
    }

    #[test]
    fn decode_unit_variant() {
        assert_eq!(decode_line(r#"{"type":"loaded"}"#).unwrap(), ControlMessage::Loaded);
    }

    #[test]
    fn decode_routed_payload() {
        let msg = decode_line(r#"{"type":"routed","key":9,"payload":{"tap":[1,2]}}"#).unwrap();
        match msg {
            ControlMessage::Routed { key, payload } => {
                assert_eq!(key, BufferKey(9));
                assert_eq!(payload["tap"][1], 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_type_is_error() {
        assert!(decode_line(r#"{"type":"teleport"}"#).is_err());
        assert!(decode_line("").is_err());
    }

    #[test]
    fn encode_close_line() {
        let line = encode_line(&PeerMessage::Close {
            window: WindowId(4),
            keep_alive: true,
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"close\",\"window\":4,\"keep_alive\":true}\n");
    }

    #[test]
    fn channel_peer_reports_closed_receiver() {
        let (mut peer, rx) = ChannelPeer::pair();
        assert!(peer.send(PeerMessage::Repaint { window: WindowId(1) }));
        drop(rx);
        assert!(!peer.send(PeerMessage::Repaint { window: WindowId(1) }));
    }

    #[tokio::test]
    async fn bind_empty_path_returns_error() {
        assert!(matches!(
            IpcListener::bind(PathBuf::new(), 1024),
            Err(IpcError::EmptySocketPath)
        ));
    }

    #[tokio::test]
    async fn bind_existing_regular_file_returns_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("exists.sock");
        std::fs::write(&socket_path, b"").expect("create file");
        assert!(matches!(
            IpcListener::bind(socket_path, 1024),
            Err(IpcError::SocketAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("sub").join("stale.sock");
        std::fs::create_dir_all(socket_path.parent().unwrap()).unwrap();
        drop(UnixListener::bind(&socket_path).expect("bind stale socket"));
        assert!(socket_path.exists());

        let listener = IpcListener::bind(socket_path.clone(), 1024).expect("rebind");
        assert!(socket_path.exists());
        drop(listener);
        assert!(!socket_path.exists());
    }

    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .expect("event")
    }

    fn hello_line(pid: u32) -> String {
        format!("{{\"type\":\"hello\",\"pid\":{pid},\"app_id\":\"com.example.mail\"}}\n")
    }

    fn spawn_listener(
        max_line_bytes: usize,
    ) -> (
        tempfile::TempDir,
        PathBuf,
        mpsc::UnboundedReceiver<BrokerEvent>,
        Arc<AtomicBool>,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("broker.sock");
        let listener = IpcListener::bind(socket_path.clone(), max_line_bytes).expect("bind");
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        tokio::spawn(listener.run(tx, Arc::clone(&shutdown)));
        (dir, socket_path, rx, shutdown)
    }

    #[tokio::test]
    async fn hello_naming_another_pid_is_refused() {
        let (_dir, socket_path, mut rx, shutdown) = spawn_listener(1024);
        let stream = UnixStream::connect(&socket_path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        let other_pid = std::process::id() + 1;
        write_half
            .write_all(hello_line(other_pid).as_bytes())
            .await
            .unwrap();

        let mut reader = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), reader.next_line())
            .await
            .expect("timeout")
            .expect("read")
            .expect("refusal line");
        assert!(line.contains("\"type\":\"error\""), "{line}");
        let eof = tokio::time::timeout(Duration::from_secs(2), reader.next_line())
            .await
            .expect("timeout")
            .expect("read");
        assert_eq!(eof, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "broker must not see the connection");
        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn endless_line_is_discarded_while_streaming() {
        let (_dir, socket_path, mut rx, shutdown) = spawn_listener(1024);
        let stream = UnixStream::connect(&socket_path).await.expect("connect");
        let (_read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(hello_line(std::process::id()).as_bytes())
            .await
            .unwrap();
        let BrokerEvent::Connected { reply, .. } = recv_event(&mut rx).await else {
            panic!("expected connected");
        };
        reply.expect("reply").send(ConnectionId(9)).expect("reply");

        // 256 KiB with no newline, far past the limit, in small writes.
        let chunk = vec![b'x'; 4096];
        for _ in 0..64 {
            write_half.write_all(&chunk).await.unwrap();
        }
        write_half
            .write_all(b"\n{\"type\":\"focus\",\"window\":2}\n")
            .await
            .unwrap();

        match recv_event(&mut rx).await {
            BrokerEvent::Inbound { conn, msg } => {
                assert_eq!(conn, ConnectionId(9));
                assert_eq!(msg, ControlMessage::Focus { window: WindowId(2) });
            }
            other => panic!("unexpected: {other:?}"),
        }
        shutdown.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn listener_handshake_inbound_and_disconnect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("broker.sock");
        let listener = IpcListener::bind(socket_path.clone(), 1024).expect("bind");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(listener.run(tx, Arc::clone(&shutdown)));

        let stream = UnixStream::connect(&socket_path).await.expect("connect");
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(hello_line(std::process::id()).as_bytes())
            .await
            .expect("write hello");

        let BrokerEvent::Connected {
            pid,
            app_id,
            parent,
            mut peer,
            reply,
        } = recv_event(&mut rx).await
        else {
            panic!("expected connected");
        };
        assert_eq!(pid, ProcessId(std::process::id()));
        assert_eq!(app_id, "com.example.mail");
        assert_eq!(parent, None);
        reply.expect("reply").send(ConnectionId(5)).expect("reply");

        // Oversized and malformed lines are skipped.
        let big = format!("{{\"type\":\"loaded\",\"pad\":\"{}\"}}\n", "x".repeat(2048));
        write_half.write_all(big.as_bytes()).await.unwrap();
        write_half.write_all(b"not json\n").await.unwrap();
        write_half
            .write_all(b"{\"type\":\"focus\",\"window\":3}\n")
            .await
            .unwrap();

        match recv_event(&mut rx).await {
            BrokerEvent::Inbound { conn, msg } => {
                assert_eq!(conn, ConnectionId(5));
                assert_eq!(msg, ControlMessage::Focus { window: WindowId(3) });
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(peer.send(PeerMessage::Repaint { window: WindowId(3) }));
        let mut reader = BufReader::new(read_half).lines();
        let line = tokio::time::timeout(Duration::from_secs(2), reader.next_line())
            .await
            .expect("timeout")
            .expect("read")
            .expect("line");
        assert_eq!(line, r#"{"type":"repaint","window":3}"#);

        drop(write_half);
        drop(reader);
        match recv_event(&mut rx).await {
            BrokerEvent::Disconnected { conn } => assert_eq!(conn, ConnectionId(5)),
            other => panic!("unexpected: {other:?}"),
        }

        shutdown.store(true, Ordering::SeqCst);
        let _ = handle.await;
    }
}
