use crate::bridge::BridgeError;
use crate::config::ConfigError;
use crate::ipc::{ChannelClosed, FrameError};
use crate::plugin::PluginError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HannaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("parent process not connected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ChannelClosed> for HannaError {
    fn from(_: ChannelClosed) -> Self {
        HannaError::Disconnected
    }
}

pub type Result<T> = std::result::Result<T, HannaError>;
