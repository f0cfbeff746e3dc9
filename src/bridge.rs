//! One bridge (main or child): the attached accessory set, its accessory
//! cache, externally published accessories, and the plugin API handler.

use crate::accessory::{generate_uuid, Accessory, PlatformAccessory, CATEGORY_BRIDGE};
use crate::api::{ApiEvent, ApiEvents, HostApi};
use crate::cache::{AccessoryCache, ReconcileReport};
use crate::config::{BridgeConfig, BridgeOptions, DEFAULT_BRIDGE_NAME, DEFAULT_BRIDGE_PIN};
use crate::identity::{BridgeIdentity, InvalidIdentity};
use crate::plugin::{is_qualified_plugin_identifier, AccessoryPlugin, Plugin, PluginManager, StaticPlatform};
use crate::ports::PortService;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

/// Interval of the warning emitted while a static platform blocks startup.
pub const SLOW_PLATFORM_WARNING: Duration = Duration::from_secs(20);

const BRIDGE_UUID_SEED: &str = "HannaBridge";

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("cannot add a bridged accessory with the same UUID as another bridged accessory: {uuid}")]
    DuplicateAccessory { uuid: String },

    #[error("accessory {name} experienced an address collision ({identity})")]
    AddressCollision { name: String, identity: BridgeIdentity },

    #[error("invalid bridge username: {0}")]
    Identity(#[from] InvalidIdentity),

    #[error("failed to publish {name}: {reason}")]
    Publish { name: String, reason: String },
}

/// Accessories attached to a bridge, keyed by uuid.
#[derive(Debug, Clone)]
pub struct Bridge {
    name: String,
    uuid: String,
    accessories: Vec<Accessory>,
}

impl Bridge {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uuid: generate_uuid(BRIDGE_UUID_SEED),
            accessories: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn accessories(&self) -> &[Accessory] {
        &self.accessories
    }

    pub fn len(&self) -> usize {
        self.accessories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessories.is_empty()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.accessories.iter().any(|a| a.uuid == uuid)
    }

    pub fn add_bridged_accessory(&mut self, accessory: Accessory) -> Result<(), BridgeError> {
        if accessory.uuid == self.uuid || self.contains(&accessory.uuid) {
            return Err(BridgeError::DuplicateAccessory {
                uuid: accessory.uuid,
            });
        }
        self.accessories.push(accessory);
        Ok(())
    }

    pub fn remove_bridged_accessory(&mut self, uuid: &str) -> bool {
        let before = self.accessories.len();
        self.accessories.retain(|a| a.uuid != uuid);
        before != self.accessories.len()
    }
}

/// What the protocol runtime needs to advertise a bridge or accessory.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishInfo {
    pub username: BridgeIdentity,
    pub port: Option<u16>,
    pub pincode: String,
    pub category: Option<u16>,
    pub bind: Option<Value>,
    pub advertiser: Option<String>,
    /// Only set when exactly four characters long.
    pub setup_id: Option<String>,
    pub insecure_access: bool,
}

/// Seam to the accessory protocol runtime.
pub trait AccessoryPublisher: Send + Sync {
    fn publish_bridge(&self, bridge: &Bridge, info: &PublishInfo) -> Result<(), BridgeError>;

    fn publish_external(&self, accessory: &Accessory, info: &PublishInfo) -> Result<(), BridgeError>;

    fn unpublish(&self, username: &BridgeIdentity);
}

/// Publisher used when no protocol runtime is linked in: logs what would be
/// advertised.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

fn describe_port(port: Option<u16>) -> String {
    port.map_or_else(|| "an automatically assigned port".to_string(), |p| p.to_string())
}

impl AccessoryPublisher for LogPublisher {
    fn publish_bridge(&self, bridge: &Bridge, info: &PublishInfo) -> Result<(), BridgeError> {
        info!(
            "Hanna v{} ({}) is running on port {}.",
            env!("CARGO_PKG_VERSION"),
            bridge.name(),
            describe_port(info.port)
        );
        debug!(username = %info.username, accessories = bridge.len(), "Bridge published");
        Ok(())
    }

    fn publish_external(&self, accessory: &Accessory, info: &PublishInfo) -> Result<(), BridgeError> {
        info!(
            "{} is running on port {}.",
            accessory.display_name,
            describe_port(info.port)
        );
        Ok(())
    }

    fn unpublish(&self, username: &BridgeIdentity) {
        debug!(username = %username, "Unpublished");
    }
}

struct BridgeState {
    bridge: Bridge,
    cache: AccessoryCache,
    external: HashMap<BridgeIdentity, PlatformAccessory>,
}

pub struct BridgeService {
    api: HostApi,
    plugins: Arc<PluginManager>,
    ports: PortService,
    publisher: Arc<dyn AccessoryPublisher>,
    options: BridgeOptions,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl BridgeService {
    pub fn new(
        api: HostApi,
        plugins: Arc<PluginManager>,
        ports: PortService,
        publisher: Arc<dyn AccessoryPublisher>,
        options: BridgeOptions,
        config: BridgeConfig,
    ) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| DEFAULT_BRIDGE_NAME.to_string());
        let state = BridgeState {
            bridge: Bridge::new(name),
            cache: AccessoryCache::for_bridge(&options),
            external: HashMap::new(),
        };
        Self {
            api,
            plugins,
            ports,
            publisher,
            options,
            config,
            state: Mutex::new(state),
        }
    }

    pub fn api(&self) -> &HostApi {
        &self.api
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn pin(&self) -> String {
        self.config
            .pin
            .clone()
            .unwrap_or_else(|| DEFAULT_BRIDGE_PIN.to_string())
    }

    /// Apply plugin API calls until every [`HostApi`] handle is dropped.
    pub fn spawn_api_handler(self: &Arc<Self>, mut events: ApiEvents) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                service.handle_api_event(event).await;
            }
            debug!("Plugin API handler finished");
        })
    }

    pub async fn handle_api_event(&self, event: ApiEvent) {
        match event {
            ApiEvent::RegisterPlatformAccessories(list) => self.register_platform_accessories(list).await,
            ApiEvent::UpdatePlatformAccessories(list) => self.update_platform_accessories(list).await,
            ApiEvent::UnregisterPlatformAccessories(list) => {
                self.unregister_platform_accessories(list).await
            }
            ApiEvent::PublishExternalAccessories(list) => self.publish_external_accessories(list).await,
        }
    }

    pub async fn load_cached_accessories(&self) -> usize {
        self.state.lock().await.cache.load().await
    }

    /// Reconcile the loaded cache against the plugins, attach survivors to
    /// the bridge and persist the result.
    pub async fn restore_cached_accessories(&self) -> ReconcileReport {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let report = state
            .cache
            .reconcile(&self.plugins, &mut state.bridge, self.options.keep_orphans());
        state.cache.save().await;
        report
    }

    pub async fn cached_accessories(&self) -> Vec<PlatformAccessory> {
        self.state.lock().await.cache.accessories().to_vec()
    }

    pub async fn bridged_accessories(&self) -> Vec<Accessory> {
        self.state.lock().await.bridge.accessories().to_vec()
    }

    pub async fn register_platform_accessories(&self, accessories: Vec<PlatformAccessory>) {
        let mut state = self.state.lock().await;
        for accessory in accessories {
            match self.plugins.get_plugin(&accessory.plugin) {
                Some(plugin) if plugin.active_dynamic_platform(&accessory.platform).is_none() => warn!(
                    "The plugin '{}' registered a new accessory for the platform '{}'. The platform couldn't be found though!",
                    accessory.plugin, accessory.platform
                ),
                Some(_) => {}
                None => warn!(
                    "A platform configured a new accessory under the plugin name '{}'. However no loaded plugin could be found for the name!",
                    accessory.plugin
                ),
            }

            if let Err(e) = state.bridge.add_bridged_accessory(accessory.accessory()) {
                warn!(
                    "[{}] Could not add accessory '{}': {}",
                    accessory.plugin, accessory.display_name, e
                );
            }
            state.cache.register(accessory);
        }
        state.cache.save().await;
    }

    pub async fn update_platform_accessories(&self, accessories: Vec<PlatformAccessory>) {
        let mut state = self.state.lock().await;
        for accessory in accessories {
            if !state.cache.update(accessory) {
                debug!("Update for an accessory that is not cached");
            }
        }
        state.cache.save().await;
    }

    pub async fn unregister_platform_accessories(&self, accessories: Vec<PlatformAccessory>) {
        let mut state = self.state.lock().await;
        for accessory in &accessories {
            state.cache.unregister(&accessory.uuid);
            state.bridge.remove_bridged_accessory(&accessory.uuid);
        }
        state.cache.save().await;
    }

    pub async fn publish_external_accessories(&self, accessories: Vec<PlatformAccessory>) {
        for accessory in accessories {
            if let Err(e) = self.publish_external_accessory(accessory).await {
                error!("{}", e);
            }
        }
    }

    /// Advertise `accessory` on its own, under an identity derived from its
    /// uuid and a port from the external port pool.
    pub async fn publish_external_accessory(&self, accessory: PlatformAccessory) -> Result<(), BridgeError> {
        let identity = BridgeIdentity::derive(&accessory.uuid);
        let port = self.ports.request_port(&identity).await;

        let mut state = self.state.lock().await;
        if state.external.contains_key(&identity) {
            return Err(BridgeError::AddressCollision {
                name: accessory.display_name,
                identity,
            });
        }

        if self.plugins.get_plugin(&accessory.plugin).is_none()
            && is_qualified_plugin_identifier(&accessory.plugin)
        {
            warn!(
                "A platform configured a external accessory under the plugin name '{}'. However no loaded plugin could be found for the name!",
                accessory.plugin
            );
        }

        let pin = self.pin();
        let info = PublishInfo {
            username: identity.clone(),
            port,
            pincode: pin.clone(),
            category: accessory.category,
            bind: self.config.bind.clone(),
            advertiser: self.config.advertiser.clone(),
            setup_id: None,
            insecure_access: self.options.host.insecure_access,
        };
        self.publisher.publish_external(&accessory.accessory(), &info)?;
        info!(
            "Please add [{}] manually in Home app. Setup Code: {}",
            accessory.display_name, pin
        );
        state.external.insert(identity, accessory);
        Ok(())
    }

    /// Build the accessory for a plugin accessory instance. `None` when the
    /// instance exposes no services.
    pub fn create_accessory(
        instance: &dyn AccessoryPlugin,
        display_name: &str,
        accessory_type: &str,
        uuid_base: Option<&str>,
    ) -> Option<Accessory> {
        if instance.services().is_empty() {
            return None;
        }
        let uuid = generate_uuid(&format!(
            "{}:{}",
            accessory_type,
            uuid_base.unwrap_or(display_name)
        ));
        Some(Accessory::new(display_name, uuid))
    }

    pub async fn add_bridged_accessory(&self, accessory: Accessory) -> Result<(), BridgeError> {
        self.state.lock().await.bridge.add_bridged_accessory(accessory)
    }

    /// Wait for a static platform's accessory list and attach it. Warns every
    /// [`SLOW_PLATFORM_WARNING`] while the platform keeps the bridge waiting.
    pub async fn load_platform_accessories(
        &self,
        plugin: &Plugin,
        platform: Box<dyn StaticPlatform>,
        platform_type: &str,
    ) {
        let mut pending = platform.accessories();
        let mut warning = interval_at(Instant::now() + SLOW_PLATFORM_WARNING, SLOW_PLATFORM_WARNING);
        let accessories = loop {
            tokio::select! {
                list = &mut pending => break list,
                _ = warning.tick() => warn!(
                    "[{}] This plugin is taking long time to load and preventing Hanna from starting.",
                    plugin.identifier()
                ),
            }
        };

        for (index, instance) in accessories.iter().enumerate() {
            let name = instance.name();
            info!("Initializing platform accessory '{}'...", name);
            match Self::create_accessory(instance.as_ref(), name, platform_type, instance.uuid_base()) {
                Some(accessory) => {
                    if let Err(e) = self.add_bridged_accessory(accessory).await {
                        warn!("[{}] Could not add platform accessory '{}': {}", plugin.identifier(), name, e);
                    }
                }
                None => info!(
                    "Platform {} returned an accessory at index {} with an empty set of services. Won't adding it to the bridge!",
                    platform_type, index
                ),
            }
        }
    }

    pub async fn publish_bridge(&self) -> Result<(), BridgeError> {
        let username = BridgeIdentity::parse(&self.config.username)?;
        let setup_id = self
            .config
            .setup_id
            .clone()
            .filter(|id| id.chars().count() == 4);
        let info = PublishInfo {
            username,
            port: self.config.port,
            pincode: self.pin(),
            category: Some(CATEGORY_BRIDGE),
            bind: self.config.bind.clone(),
            advertiser: self.config.advertiser.clone(),
            setup_id,
            insecure_access: self.options.host.insecure_access,
        };
        let state = self.state.lock().await;
        self.publisher.publish_bridge(&state.bridge, &info)
    }

    /// Unpublish everything, persist the cache and tell plugins the host is
    /// going away.
    pub async fn teardown(&self) {
        let state = self.state.lock().await;
        if let Ok(username) = BridgeIdentity::parse(&self.config.username) {
            self.publisher.unpublish(&username);
        }
        for identity in state.external.keys() {
            self.publisher.unpublish(identity);
        }
        state.cache.save().await;
        self.api.signal_shutdown();
    }
}
