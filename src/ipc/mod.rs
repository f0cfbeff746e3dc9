//! Ordered message passing between the host and its child bridges.

pub mod channel;
pub mod protocol;

pub use channel::{ChannelClosed, ChannelReceiver, ChannelSender, MessageChannel};
pub use protocol::{
    Envelope, FrameError, LoadPayload, LoadedPayload, MessageFrame, PortAllocated, PortRequest,
};
