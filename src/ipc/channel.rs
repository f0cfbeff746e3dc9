use super::protocol::{FrameError, MessageFrame};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message channel is closed")]
pub struct ChannelClosed;

/// Sending half of a [`MessageChannel`]. Cheap to clone; messages from all
/// clones are written in the order `send` was called.
pub struct ChannelSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for ChannelSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> ChannelSender<T> {
    /// Queue a message. Delivery is at-most-once: a message queued while the
    /// peer goes away is lost.
    pub fn send(&self, message: T) -> Result<(), ChannelClosed> {
        self.tx.send(message).map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`MessageChannel`].
pub struct ChannelReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> ChannelReceiver<T> {
    /// Next message in send order; `None` once the peer closed the stream.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Ordered duplex channel of typed messages over a byte stream pair.
///
/// One writer task drains the outgoing queue into frames, one reader task
/// decodes incoming frames. An undecodable frame is logged and skipped; any
/// other stream error closes that direction.
pub struct MessageChannel;

impl MessageChannel {
    pub fn open<Out, In, R, W>(
        reader: R,
        writer: W,
        label: impl Into<String>,
    ) -> (ChannelSender<Out>, ChannelReceiver<In>)
    where
        Out: Serialize + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label = label.into();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Out>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();

        let write_label = label.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            while let Some(message) = out_rx.recv().await {
                // Encode before awaiting so `Out` never has to be `Sync`.
                let frame = match MessageFrame::encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(channel = %write_label, "Dropping unencodable message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = MessageFrame::write_frame(&mut writer, &frame).await {
                    debug!(channel = %write_label, "Channel write failed: {}", e);
                    break;
                }
            }
            // Signals end-of-stream to the peer's reader.
            let _ = writer.shutdown().await;
            trace!(channel = %write_label, "Channel writer finished");
        });

        tokio::spawn(async move {
            let mut reader = reader;
            loop {
                match MessageFrame::read::<_, In>(&mut reader).await {
                    Ok(Some(message)) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(FrameError::Decode(e)) => {
                        warn!(channel = %label, "Discarding undecodable message: {}", e);
                    }
                    Err(e) => {
                        debug!(channel = %label, "Channel read failed: {}", e);
                        break;
                    }
                }
            }
            trace!(channel = %label, "Channel reader finished");
        });

        (
            ChannelSender { tx: out_tx },
            ChannelReceiver { rx: in_rx },
        )
    }

    /// Two connected in-process endpoints; `A` flows left to right, `B`
    /// right to left.
    #[allow(clippy::type_complexity)]
    pub fn duplex<A, B>() -> (
        (ChannelSender<A>, ChannelReceiver<B>),
        (ChannelSender<B>, ChannelReceiver<A>),
    )
    where
        A: Serialize + DeserializeOwned + Send + 'static,
        B: Serialize + DeserializeOwned + Send + 'static,
    {
        let (left, right) = tokio::io::duplex(DUPLEX_BUFFER);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::open(left_read, left_write, "left"),
            Self::open(right_read, right_write, "right"),
        )
    }
}
