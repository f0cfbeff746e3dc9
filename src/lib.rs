pub mod accessory;
pub mod api;
pub mod bridge;
pub mod cache;
pub mod child;
pub mod cli;
pub mod config;
pub mod control;
pub mod env;
pub mod error;
pub mod identity;
pub mod ipc;
pub mod logging;
pub mod plugin;
pub mod ports;
pub mod server;
pub mod storage;
pub mod supervisor;

pub use bridge::{AccessoryPublisher, BridgeService, LogPublisher};
pub use config::{HostConfig, HostOptions};
pub use error::{HannaError, Result};
pub use plugin::{PluginManager, PluginModule};
pub use server::HostServer;
