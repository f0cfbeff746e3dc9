//! READY → LOAD → LOADED → START → ONLINE, one stage at a time.

use crate::ipc::{Envelope, PortRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    AwaitingReady,
    AwaitingLoaded,
    AwaitingOnline,
    Online,
}

/// What the supervisor does in response to one child message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    SendLoad,
    SendStart { version: String },
    MarkOnline,
    AllocatePort(PortRequest),
    Ignore,
}

/// Handshake progress of one spawned child. A fresh value is used per spawn.
#[derive(Debug)]
pub struct Handshake {
    stage: HandshakeStage,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            stage: HandshakeStage::AwaitingReady,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Advance on `message`. Out-of-order handshake messages are ignored;
    /// port requests are served at any stage.
    pub fn on_message(&mut self, message: Envelope) -> HandshakeAction {
        match (self.stage, message) {
            (HandshakeStage::AwaitingReady, Envelope::Ready) => {
                self.stage = HandshakeStage::AwaitingLoaded;
                HandshakeAction::SendLoad
            }
            (HandshakeStage::AwaitingLoaded, Envelope::Loaded(loaded)) => {
                self.stage = HandshakeStage::AwaitingOnline;
                HandshakeAction::SendStart {
                    version: loaded.version,
                }
            }
            (HandshakeStage::AwaitingOnline, Envelope::Online) => {
                self.stage = HandshakeStage::Online;
                HandshakeAction::MarkOnline
            }
            (_, Envelope::PortRequest(request)) => HandshakeAction::AllocatePort(request),
            _ => HandshakeAction::Ignore,
        }
    }
}
