//! API handed to plugins.
//!
//! Calls are queued as [`ApiEvent`]s and applied by the bridge that owns the
//! accessories, so plugins never touch bridge state directly.

use crate::accessory::PlatformAccessory;
use crate::plugin::is_qualified_plugin_identifier;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Host API version exposed to plugins.
pub const API_VERSION: f32 = 1.0;

/// Launch phase observed by plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Launching,
    /// All plugins are initialized and the cache has been restored. The
    /// bridge may still be waiting for static platforms.
    FinishedLaunching,
    /// Accessories are unpublished and the cache has been saved.
    Shutdown,
}

#[derive(Debug)]
pub enum ApiEvent {
    RegisterPlatformAccessories(Vec<PlatformAccessory>),
    UpdatePlatformAccessories(Vec<PlatformAccessory>),
    UnregisterPlatformAccessories(Vec<PlatformAccessory>),
    PublishExternalAccessories(Vec<PlatformAccessory>),
}

impl ApiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ApiEvent::RegisterPlatformAccessories(_) => "registerPlatformAccessories",
            ApiEvent::UpdatePlatformAccessories(_) => "updatePlatformAccessories",
            ApiEvent::UnregisterPlatformAccessories(_) => "unregisterPlatformAccessories",
            ApiEvent::PublishExternalAccessories(_) => "publishExternalAccessories",
        }
    }
}

/// Receiving end of the plugin API, drained by the bridge.
pub type ApiEvents = mpsc::UnboundedReceiver<ApiEvent>;

#[derive(Clone)]
pub struct HostApi {
    events: mpsc::UnboundedSender<ApiEvent>,
    lifecycle: watch::Sender<Lifecycle>,
}

impl HostApi {
    pub fn new() -> (Self, ApiEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Launching);
        (Self { events, lifecycle }, rx)
    }

    pub fn version(&self) -> f32 {
        API_VERSION
    }

    pub fn server_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    fn emit(&self, event: ApiEvent) {
        let name = event.name();
        if self.events.send(event).is_err() {
            debug!(event = name, "Bridge is gone; dropping API call");
        }
    }

    pub fn register_platform_accessories(
        &self,
        plugin: &str,
        platform: &str,
        mut accessories: Vec<PlatformAccessory>,
    ) {
        for accessory in &mut accessories {
            accessory.plugin = plugin.to_string();
            accessory.platform = platform.to_string();
        }
        self.emit(ApiEvent::RegisterPlatformAccessories(accessories));
    }

    pub fn update_platform_accessories(&self, accessories: Vec<PlatformAccessory>) {
        self.emit(ApiEvent::UpdatePlatformAccessories(accessories));
    }

    pub fn unregister_platform_accessories(
        &self,
        _plugin: &str,
        _platform: &str,
        accessories: Vec<PlatformAccessory>,
    ) {
        self.emit(ApiEvent::UnregisterPlatformAccessories(accessories));
    }

    pub fn publish_external_accessories(&self, plugin: &str, mut accessories: Vec<PlatformAccessory>) {
        if !is_qualified_plugin_identifier(plugin) {
            info!(
                "One of your plugins incorrectly registered an external accessory using the platform name ({}) and not the plugin identifier. Please report this to the developer!",
                plugin
            );
        }
        for accessory in &mut accessories {
            accessory.plugin = plugin.to_string();
        }
        self.emit(ApiEvent::PublishExternalAccessories(accessories));
    }

    pub fn lifecycle(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    pub fn signal_finished(&self) {
        self.lifecycle.send_replace(Lifecycle::FinishedLaunching);
    }

    pub fn signal_shutdown(&self) {
        self.lifecycle.send_replace(Lifecycle::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_stamps_owner() {
        let (api, mut events) = HostApi::new();
        api.register_platform_accessories(
            "hanna-lights",
            "Lights",
            vec![PlatformAccessory::new("Lamp", "u1")],
        );
        match events.try_recv().unwrap() {
            ApiEvent::RegisterPlatformAccessories(list) => {
                assert_eq!(list[0].plugin, "hanna-lights");
                assert_eq!(list[0].platform, "Lights");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifecycle_is_observable() {
        let (api, _events) = HostApi::new();
        let mut lifecycle = api.lifecycle();
        assert_eq!(*lifecycle.borrow(), Lifecycle::Launching);
        api.signal_finished();
        lifecycle.changed().await.unwrap();
        assert_eq!(*lifecycle.borrow_and_update(), Lifecycle::FinishedLaunching);
        api.signal_shutdown();
        assert_eq!(*api.lifecycle().borrow(), Lifecycle::Shutdown);
    }
}
