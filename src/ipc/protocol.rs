//! Child bridge message catalog and its wire framing.
//!
//! Every message is a JSON envelope `{"id": <kind>, "data": <payload>}`
//! written as one frame: `[4-byte length (little-endian)][JSON bytes]`.
//! The same framing carries the control-plane catalog.

use crate::config::{BridgeConfig, BridgeOptions, ConfigBlock, HostConfig, PluginKind};
use crate::identity::BridgeIdentity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

/// Message exchanged between the host and one child bridge process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", content = "data", rename_all = "camelCase")]
pub enum Envelope {
    /// Parent → child: configuration bundle for the plugin to load.
    Load(Box<LoadPayload>),
    /// Parent → child: start publishing.
    Start,
    /// Child → parent: first message of a fresh child.
    Ready,
    /// Child → parent: plugin loaded.
    Loaded(LoadedPayload),
    /// Child → parent: the child's bridge is listening.
    Online,
    /// Child → parent: allocate an external port for `username`.
    PortRequest(PortRequest),
    /// Parent → child: answer to a [`Envelope::PortRequest`].
    PortAllocated(PortAllocated),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Load(_) => "load",
            Envelope::Start => "start",
            Envelope::Ready => "ready",
            Envelope::Loaded(_) => "loaded",
            Envelope::Online => "online",
            Envelope::PortRequest(_) => "portRequest",
            Envelope::PortAllocated(_) => "portAllocated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadPayload {
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub identifier: String,
    /// Identifier of the plugin that provides `identifier`.
    pub plugin: String,
    pub plugin_path: PathBuf,
    pub plugin_config: Vec<ConfigBlock>,
    pub bridge_config: BridgeConfig,
    pub bridge_options: BridgeOptions,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedPayload {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub username: BridgeIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocated {
    pub username: BridgeIdentity,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Length-prefixed JSON frames.
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a message to bytes with length prefix
    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
        let bytes = serde_json::to_vec(message).map_err(FrameError::Encode)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    pub async fn write<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let bytes = Self::encode(message)?;
        Self::write_frame(writer, &bytes).await
    }

    /// Write a frame produced by [`MessageFrame::encode`].
    pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame. `Ok(None)` means the peer closed the stream at a frame
    /// boundary. A body that fails to decode is consumed, so the caller may
    /// keep reading.
    pub async fn read<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
    where
        R: AsyncRead + Unpin,
        T: DeserializeOwned,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(FrameError::Decode)
    }
}
