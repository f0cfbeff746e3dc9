//! Main host process: loads the configuration, constructs plugins for the
//! main bridge, supervises child bridges and serves the control plane.

use crate::accessory::Accessory;
use crate::api::{ApiEvents, HostApi};
use crate::bridge::{AccessoryPublisher, BridgeService};
use crate::config::{BridgeConfig, BridgeOptions, ConfigBlock, ConfigError, HostConfig, HostOptions, PluginKind};
use crate::control::{event_channel, ControlEvent, ControlRequest, ControlServer, ServerStatus};
use crate::env::StoragePaths;
use crate::error::Result;
use crate::identity::BridgeIdentity;
use crate::plugin::{local_name, Plugin, PluginManager, PluginModule, PlatformInstance, StaticPlatform};
use crate::ports::{PortPool, PortService};
use crate::supervisor::{ChildBridgeService, ChildMetadata, ChildSpawner, SupervisorContext};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

struct PendingPlatform {
    plugin: Arc<Plugin>,
    platform: Box<dyn StaticPlatform>,
    identifier: String,
}

pub struct HostServer {
    config: Arc<HostConfig>,
    options: HostOptions,
    paths: StoragePaths,
    plugins: Arc<PluginManager>,
    ports: Arc<PortPool>,
    api: HostApi,
    api_events: Mutex<Option<ApiEvents>>,
    bridge: Arc<BridgeService>,
    spawner: Arc<dyn ChildSpawner>,
    events: broadcast::Sender<ControlEvent>,
    shutdown: watch::Sender<bool>,
    child_bridges: Mutex<Vec<ChildBridgeService>>,
}

impl HostServer {
    /// Load `config.json` from `paths` and set up the main bridge.
    pub fn new(
        options: HostOptions,
        paths: StoragePaths,
        modules: Vec<Arc<dyn PluginModule>>,
        publisher: Arc<dyn AccessoryPublisher>,
        spawner: Arc<dyn ChildSpawner>,
    ) -> Result<Self> {
        let config = HostConfig::load(&paths.config_path())?;
        Ok(Self::with_config(config, options, paths, modules, publisher, spawner))
    }

    pub fn with_config(
        config: HostConfig,
        options: HostOptions,
        paths: StoragePaths,
        modules: Vec<Arc<dyn PluginModule>>,
        publisher: Arc<dyn AccessoryPublisher>,
        spawner: Arc<dyn ChildSpawner>,
    ) -> Self {
        let disabled = config.disabled_plugins.clone().unwrap_or_default();
        let plugins = Arc::new(PluginManager::new(
            modules,
            config.plugins.as_deref(),
            &disabled,
        ));
        let ports = Arc::new(PortPool::new(config.port_range()));
        let (api, api_events) = HostApi::new();
        let bridge = Arc::new(BridgeService::new(
            api.clone(),
            Arc::clone(&plugins),
            PortService::Local(Arc::clone(&ports)),
            publisher,
            BridgeOptions::main(options.clone(), &paths),
            config.bridge.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            options,
            paths,
            plugins,
            ports,
            api,
            api_events: Mutex::new(Some(api_events)),
            bridge,
            spawner,
            events: event_channel(),
            shutdown,
            child_bridges: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn api(&self) -> &HostApi {
        &self.api
    }

    pub fn bridge(&self) -> &Arc<BridgeService> {
        &self.bridge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    fn children(&self) -> MutexGuard<'_, Vec<ChildBridgeService>> {
        self.child_bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn child_bridges(&self) -> Vec<ChildBridgeService> {
        self.children().clone()
    }

    pub fn find_child_bridge(&self, identity: &BridgeIdentity) -> Option<ChildBridgeService> {
        self.children()
            .iter()
            .find(|child| child.identity() == identity)
            .cloned()
    }

    pub fn child_bridge_metadata(&self) -> Vec<ChildMetadata> {
        self.children().iter().map(ChildBridgeService::metadata).collect()
    }

    fn set_server_status(&self, status: ServerStatus) {
        debug!(?status, "Server status");
        let _ = self.events.send(ControlEvent::ServerStatusUpdate { status });
    }

    fn supervisor_context(&self) -> SupervisorContext {
        SupervisorContext {
            host_config: Arc::clone(&self.config),
            options: self.options.clone(),
            paths: self.paths.clone(),
            ports: Arc::clone(&self.ports),
            spawner: Arc::clone(&self.spawner),
            events: self.events.clone(),
            shutdown: self.shutdown.subscribe(),
        }
    }

    /// Bring the host up: control socket, cached accessories, plugins, child
    /// bridges, then publish the main bridge once every static platform has
    /// delivered its accessories.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_server_status(ServerStatus::Pending);

        if !self.config.bridge.disable_ipc {
            self.start_control_server();
        }

        self.bridge.load_cached_accessories().await;
        let events = self
            .api_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            self.bridge.spawn_api_handler(events);
        }

        let pending = self.load_platforms();
        self.load_accessories().await;

        for child in self.child_bridges() {
            child.start();
        }

        self.bridge.restore_cached_accessories().await;
        self.api.signal_finished();

        let mut platforms = JoinSet::new();
        for PendingPlatform {
            plugin,
            platform,
            identifier,
        } in pending
        {
            let bridge = Arc::clone(&self.bridge);
            platforms.spawn(async move {
                bridge
                    .load_platform_accessories(&plugin, platform, &identifier)
                    .await
            });
        }
        while let Some(joined) = platforms.join_next().await {
            if let Err(e) = joined {
                error!("Static platform task failed: {}", e);
            }
        }

        self.bridge.publish_bridge().await?;
        if !self.options.hide_qr_code {
            info!(
                "Scan the code with your Home app on your iOS device to pair with Hanna, or enter this code: {}",
                self.config.bridge.pin.as_deref().unwrap_or_default()
            );
        }

        self.set_server_status(ServerStatus::Ok);
        Ok(())
    }

    fn start_control_server(self: &Arc<Self>) {
        let socket_path = self.paths.control_socket_path();
        match ControlServer::bind(&socket_path, self.events.clone()) {
            Ok((server, requests)) => {
                tokio::spawn(server.run(self.shutdown.subscribe()));
                tokio::spawn(Arc::clone(self).serve_control_requests(requests));
            }
            Err(e) => warn!(
                "Failed to open control socket {}: {}",
                socket_path.display(),
                e
            ),
        }
    }

    async fn serve_control_requests(self: Arc<Self>, mut requests: mpsc::UnboundedReceiver<ControlRequest>) {
        while let Some(request) = requests.recv().await {
            self.handle_control_request(request).await;
        }
    }

    pub async fn handle_control_request(&self, request: ControlRequest) {
        match request {
            ControlRequest::RestartChildBridge(username) => {
                let child = BridgeIdentity::parse(&username)
                    .ok()
                    .and_then(|identity| self.find_child_bridge(&identity));
                match child {
                    Some(child) => child.restart_bridge().await,
                    None => warn!("Cannot restart child bridge {}: no such bridge", username),
                }
            }
            ControlRequest::ChildBridgeMetadataRequest => {
                let metadata = self.child_bridge_metadata();
                let _ = self
                    .events
                    .send(ControlEvent::ChildBridgeMetadataResponse(metadata));
            }
        }
    }

    /// Check a `_bridge` block before a child bridge is created for it.
    pub fn validate_child_bridge_config(
        &self,
        kind: PluginKind,
        identifier: &str,
        bridge: &BridgeConfig,
    ) -> std::result::Result<BridgeIdentity, ConfigError> {
        let identity = BridgeIdentity::parse(&bridge.username).map_err(|source| ConfigError::InvalidIdentity {
            kind,
            identifier: identifier.to_string(),
            source,
        })?;

        if let Some(existing) = self.find_child_bridge(&identity) {
            match kind {
                PluginKind::Platform => {
                    return Err(ConfigError::DuplicatePlatformIdentity {
                        kind,
                        identifier: identifier.to_string(),
                        identity,
                    })
                }
                PluginKind::Accessory
                    if existing.kind() != PluginKind::Accessory || existing.identifier() != identifier =>
                {
                    return Err(ConfigError::MixedAccessoryGroup {
                        kind,
                        identifier: identifier.to_string(),
                        identity,
                    })
                }
                PluginKind::Accessory => {}
            }
        }

        if self.config.main_identity().as_ref() == Some(&identity) {
            return Err(ConfigError::CollidesWithMainBridge {
                kind,
                identifier: identifier.to_string(),
                identity,
            });
        }
        Ok(identity)
    }

    /// Create the child bridge for `block`, or append to the existing
    /// accessory group with the same identity.
    fn add_child_bridge_config(
        &self,
        kind: PluginKind,
        identifier: &str,
        plugin: &Arc<Plugin>,
        block: &ConfigBlock,
        bridge: &BridgeConfig,
    ) {
        let identity = match self.validate_child_bridge_config(kind, identifier, bridge) {
            Ok(identity) => identity,
            Err(e) => {
                error!("{}", e);
                return;
            }
        };

        if let Some(existing) = self.find_child_bridge(&identity) {
            existing.add_config(block.clone());
            return;
        }

        info!(
            "Adding {} {} to child bridge {}",
            kind, identifier, identity
        );
        let mut bridge = bridge.clone();
        bridge.username = identity.to_string();
        let child = ChildBridgeService::new(
            kind,
            identifier,
            identity,
            Arc::clone(plugin),
            bridge,
            self.supervisor_context(),
        );
        child.add_config(block.clone());
        self.children().push(child);
    }

    fn load_platforms(&self) -> Vec<PendingPlatform> {
        let mut pending = Vec::new();
        for (index, block) in self.config.platforms.iter().enumerate() {
            let Some(identifier) = block.platform.as_deref() else {
                warn!(
                    "Your config.json contains an illegal platform configuration object at index {}: missing property 'platform'. Skipping it.",
                    index
                );
                continue;
            };

            let plugin = match self.plugins.get_plugin_for_platform(identifier) {
                Ok(plugin) => plugin,
                Err(e) => {
                    error!("Error loading platform: {}", e);
                    continue;
                }
            };
            if plugin.is_disabled() {
                warn!(
                    "Ignoring config for the platform \"{}\" in your config.json as the plugin \"{}\" has been disabled.",
                    identifier,
                    plugin.identifier()
                );
                continue;
            }

            if let Some(bridge) = &block.bridge {
                self.add_child_bridge_config(PluginKind::Platform, identifier, &plugin, block, bridge);
                continue;
            }

            let constructor = match plugin.platform_constructor(identifier) {
                Ok(constructor) => constructor,
                Err(e) => {
                    error!("Error loading platform: {}", e);
                    continue;
                }
            };
            info!("Initializing {} platform...", local_name(identifier));
            match constructor(block, &self.api) {
                PlatformInstance::Dynamic(platform) => plugin.assign_dynamic_platform(identifier, platform),
                PlatformInstance::Static(platform) => pending.push(PendingPlatform {
                    plugin: Arc::clone(&plugin),
                    platform,
                    identifier: identifier.to_string(),
                }),
                PlatformInstance::Independent => {
                    debug!(platform = identifier, "Platform runs independently")
                }
            }
        }
        pending
    }

    async fn load_accessories(&self) {
        for (index, block) in self.config.accessories.iter().enumerate() {
            let Some(identifier) = block.accessory.as_deref() else {
                warn!(
                    "Your config.json contains an illegal accessory configuration object at index {}: missing property 'accessory'. Skipping it.",
                    index
                );
                continue;
            };
            let Some(display_name) = block.name.as_deref() else {
                warn!(
                    "Could not load accessory {} at index {} as it is missing the required 'name' property!",
                    identifier, index
                );
                continue;
            };

            let plugin = match self.plugins.get_plugin_for_accessory(identifier) {
                Ok(plugin) => plugin,
                Err(e) => {
                    error!("Error loading accessory: {}", e);
                    continue;
                }
            };
            if plugin.is_disabled() {
                warn!(
                    "Ignoring config for the accessory \"{}\" in your config.json as the plugin \"{}\" has been disabled.",
                    identifier,
                    plugin.identifier()
                );
                continue;
            }

            if let Some(bridge) = &block.bridge {
                self.add_child_bridge_config(PluginKind::Accessory, identifier, &plugin, block, bridge);
                continue;
            }

            let constructor = match plugin.accessory_constructor(identifier) {
                Ok(constructor) => constructor,
                Err(e) => {
                    error!("Error loading accessory: {}", e);
                    continue;
                }
            };
            info!("Initializing {} accessory...", local_name(identifier));
            let instance = constructor(block, &self.api);
            let uuid_base = instance
                .uuid_base()
                .map(str::to_string)
                .or_else(|| block.uuid_base.clone());
            let accessory: Option<Accessory> = BridgeService::create_accessory(
                instance.as_ref(),
                display_name,
                identifier,
                uuid_base.as_deref(),
            );
            match accessory {
                Some(accessory) => {
                    if let Err(e) = self.bridge.add_bridged_accessory(accessory).await {
                        warn!("Could not add accessory {}: {}", display_name, e);
                    }
                }
                None => warn!(
                    "Accessory {} returned empty set of services; not adding it to the bridge.",
                    identifier
                ),
            }
        }
    }

    /// Stop child bridges (without waiting for them), unpublish the main
    /// bridge and persist its cache.
    pub async fn teardown(&self) {
        self.shutdown.send_replace(true);
        for child in self.child_bridges() {
            child.teardown();
        }
        self.bridge.teardown().await;
        self.set_server_status(ServerStatus::Down);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::RecordingPublisher;
    use crate::ipc::{Envelope, LoadedPayload};
    use crate::plugin::testing::TestModule;
    use crate::supervisor::testing::{FakeChild, FakeSpawner};
    use crate::supervisor::ChildStatus;
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        server: Arc<HostServer>,
        publisher: Arc<RecordingPublisher>,
        children: mpsc::UnboundedReceiver<FakeChild>,
    }

    fn fixture(config: serde_json::Value) -> Fixture {
        fixture_with(config, Vec::new())
    }

    fn fixture_with(config: serde_json::Value, extra: Vec<Arc<dyn PluginModule>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config: HostConfig = serde_json::from_value(config).unwrap();
        config.bridge.disable_ipc = true;
        let config = config.normalize().unwrap();

        let mut modules = vec![
            TestModule::new("hanna-lights").platform("Lights").into_module(),
            TestModule::new("hanna-fan")
                .accessory("Fan")
                .accessory("Heater")
                .into_module(),
        ];
        modules.extend(extra);

        let publisher = Arc::new(RecordingPublisher::default());
        let (spawner, children) = FakeSpawner::new();
        let server = Arc::new(HostServer::with_config(
            config,
            HostOptions::default(),
            StoragePaths::at(dir.path()),
            modules,
            publisher.clone(),
            spawner,
        ));
        Fixture {
            _dir: dir,
            server,
            publisher,
            children,
        }
    }

    fn bridge(username: &str) -> BridgeConfig {
        BridgeConfig {
            username: username.into(),
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn child_bridge_validation() {
        let f = fixture(serde_json::json!({
            "bridge": {"username": "CC:22:3D:E3:CE:30"},
            "platforms": [{"platform": "Lights", "_bridge": {"username": "0E:00:00:00:00:01"}}],
            "accessories": [{"accessory": "Fan", "name": "Ceiling", "_bridge": {"username": "0E:00:00:00:00:02"}}]
        }));
        f.server.load_platforms();
        f.server.load_accessories().await;
        let server = &f.server;

        assert!(matches!(
            server.validate_child_bridge_config(PluginKind::Platform, "Lights", &bridge("nope")),
            Err(ConfigError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            server.validate_child_bridge_config(PluginKind::Platform, "Lights", &bridge("0e:00:00:00:00:01")),
            Err(ConfigError::DuplicatePlatformIdentity { .. })
        ));
        assert!(matches!(
            server.validate_child_bridge_config(PluginKind::Accessory, "Heater", &bridge("0E:00:00:00:00:02")),
            Err(ConfigError::MixedAccessoryGroup { .. })
        ));
        assert!(server
            .validate_child_bridge_config(PluginKind::Accessory, "Fan", &bridge("0E:00:00:00:00:02"))
            .is_ok());
        assert!(matches!(
            server.validate_child_bridge_config(PluginKind::Accessory, "Fan", &bridge("cc:22:3d:e3:ce:30")),
            Err(ConfigError::CollidesWithMainBridge { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_loads_plugins_and_publishes() {
        let dynamic = TestModule::new("hanna-blinds").platform("Blinds");
        let constructed = Arc::clone(&dynamic.constructed);
        let mut f = fixture_with(
            serde_json::json!({
                "platforms": [
                    {"platform": "Blinds", "name": "Living Room"},
                    {"platform": "Lights", "_bridge": {"username": "0E:00:00:00:00:01"}},
                    {"platform": "Missing"},
                    {"name": "no platform"}
                ],
                "accessories": [
                    {"accessory": "Fan", "name": "Ceiling"},
                    {"accessory": "Fan"},
                    {"accessory": "Fan", "name": "Desk", "_bridge": {"username": "0E:00:00:00:00:02"}},
                    {"accessory": "Fan", "name": "Floor", "_bridge": {"username": "0E:00:00:00:00:02"}}
                ]
            }),
            vec![dynamic.into_module()],
        );
        let mut events = f.server.subscribe();

        f.server.start().await.unwrap();

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(f
            .server
            .plugins
            .get_plugin("hanna-blinds")
            .unwrap()
            .active_dynamic_platform("Blinds")
            .is_some());

        let published = f.publisher.bridges.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, 1, "only the Ceiling fan is bridged");

        let children = f.server.child_bridges();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].plugin_config().len(), 2);

        let mut spawned = 0;
        while let Ok(Some(mut child)) =
            tokio::time::timeout(std::time::Duration::from_secs(1), f.children.recv()).await
        {
            child.sender.send(Envelope::Ready).unwrap();
            assert!(matches!(child.receiver.recv().await, Some(Envelope::Load(_))));
            spawned += 1;
        }
        assert_eq!(spawned, 2);

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ControlEvent::ServerStatusUpdate { status } = event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses, vec![ServerStatus::Pending, ServerStatus::Ok]);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_plugin_config_is_skipped() {
        let f = fixture(serde_json::json!({
            "disabledPlugins": ["hanna-fan"],
            "accessories": [{"accessory": "Fan", "name": "Ceiling"}]
        }));
        f.server.start().await.unwrap();
        assert_eq!(f.publisher.bridges.lock().unwrap()[0].0, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn control_requests_and_teardown() {
        let mut f = fixture(serde_json::json!({
            "platforms": [{"platform": "Lights", "_bridge": {"username": "0E:00:00:00:00:01"}}]
        }));
        f.server.start().await.unwrap();
        let mut child = f.children.recv().await.unwrap();
        child.sender.send(Envelope::Ready).unwrap();
        child.receiver.recv().await.unwrap();
        child
            .sender
            .send(Envelope::Loaded(LoadedPayload {
                version: "1.2.3".into(),
            }))
            .unwrap();
        child.receiver.recv().await.unwrap();

        let mut events = f.server.subscribe();
        f.server
            .handle_control_request(ControlRequest::ChildBridgeMetadataRequest)
            .await;
        match events.recv().await.unwrap() {
            ControlEvent::ChildBridgeMetadataResponse(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].username.as_str(), "0E:00:00:00:00:01");
                assert_eq!(list[0].status, ChildStatus::Pending);
            }
            other => panic!("unexpected event {other:?}"),
        }

        f.server
            .handle_control_request(ControlRequest::RestartChildBridge("0e:00:00:00:00:01".into()))
            .await;
        child.terminated.await.unwrap();
        child.exit.send(Default::default()).unwrap();
        let mut restarted = f.children.recv().await.unwrap();

        f.server.teardown().await;
        restarted.terminated.await.unwrap();
        assert!(!f.publisher.unpublished.lock().unwrap().is_empty());
        assert_eq!(
            f.server.child_bridges()[0].status(),
            ChildStatus::Down
        );
    }
}
