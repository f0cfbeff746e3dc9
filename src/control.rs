//! Control plane between the host and an external controller.
//!
//! Requests and events use the same length-prefixed JSON frames as the child
//! channel, served on a local socket under the storage path.

use crate::ipc::MessageChannel;
use crate::supervisor::ChildMetadata;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Capacity of the event fan-out; slower clients lose the oldest events.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "kebab-case")]
pub enum ControlRequest {
    /// Restart the child bridge with this username.
    RestartChildBridge(String),
    ChildBridgeMetadataRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Pending,
    Ok,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "kebab-case")]
pub enum ControlEvent {
    ChildBridgeMetadataResponse(Vec<ChildMetadata>),
    ChildBridgeStatusUpdate(ChildMetadata),
    ServerStatusUpdate { status: ServerStatus },
}

pub fn event_channel() -> broadcast::Sender<ControlEvent> {
    broadcast::channel(EVENT_BUFFER).0
}

/// Forward host events to one client and its requests to the host until
/// either side goes away.
pub async fn serve_connection<R, W>(
    reader: R,
    writer: W,
    events: broadcast::Receiver<ControlEvent>,
    requests: mpsc::UnboundedSender<ControlRequest>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut events = events;
    let (sender, mut receiver) = MessageChannel::open::<ControlEvent, ControlRequest, _, _>(reader, writer, "control");

    loop {
        tokio::select! {
            request = receiver.recv() => match request {
                Some(request) => {
                    trace!(?request, "Control request");
                    if requests.send(request).is_err() {
                        break;
                    }
                }
                None => break,
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if sender.send(event).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Control client is too slow, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    trace!("Control connection closed");
}

/// Accepts controller connections on a unix socket.
pub struct ControlServer {
    socket_path: PathBuf,
    events: broadcast::Sender<ControlEvent>,
    requests: mpsc::UnboundedSender<ControlRequest>,
    #[cfg(unix)]
    listener: tokio::net::UnixListener,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one. Requests from all
    /// clients arrive on the returned receiver.
    #[cfg(unix)]
    pub fn bind(
        socket_path: &Path,
        events: broadcast::Sender<ControlEvent>,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ControlRequest>)> {
        use std::os::unix::fs::PermissionsExt;

        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = tokio::net::UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!("Control socket listening on: {}", socket_path.display());

        let (requests, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                socket_path: socket_path.to_path_buf(),
                events,
                requests,
                listener,
            },
            rx,
        ))
    }

    #[cfg(not(unix))]
    pub fn bind(
        _socket_path: &Path,
        _events: broadcast::Sender<ControlEvent>,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<ControlRequest>)> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "control socket requires unix domain sockets",
        ))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serve until `shutdown` flips to `true`, then remove the socket file.
    #[cfg(unix)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                conn = self.listener.accept() => match conn {
                    Ok((stream, _)) => {
                        debug!("Control client connected");
                        let (reader, writer) = stream.into_split();
                        tokio::spawn(serve_connection(
                            reader,
                            writer,
                            self.events.subscribe(),
                            self.requests.clone(),
                        ));
                    }
                    Err(e) => error!("Control socket accept error: {}", e),
                },
                _ = shutdown.wait_for(|down| *down) => break,
            }
        }

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove control socket: {}", e);
        }
        info!("Control socket closed");
    }

    #[cfg(not(unix))]
    pub async fn run(self, _shutdown: watch::Receiver<bool>) {}
}
