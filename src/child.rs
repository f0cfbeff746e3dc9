//! Child bridge process side of the handshake.
//!
//! The parent drives this process over the message channel on stdin/stdout:
//! `READY` is sent first, `LOAD` resolves the plugin, `START` brings the
//! bridge up and answers with `ONLINE`. Port requests go to the parent.

use crate::api::HostApi;
use crate::bridge::{AccessoryPublisher, BridgeService};
use crate::config::PluginKind;
use crate::error::{HannaError, Result};
use crate::ipc::{ChannelSender, Envelope, LoadPayload, LoadedPayload, MessageChannel};
use crate::plugin::{PluginError, PluginManager, PluginModule, PlatformInstance};
use crate::ports::{PortService, RemotePortClient};
use crate::supervisor::SHUTDOWN_GRACE;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Exit code when the child cannot continue.
pub const EXIT_FAILURE: i32 = 1;

pub fn signal_name(signal: i32) -> String {
    match signal {
        2 => "SIGINT".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

#[derive(Clone)]
struct LoadedPlugin {
    payload: Arc<LoadPayload>,
    plugins: Arc<PluginManager>,
}

struct ChildBridge {
    sender: ChannelSender<Envelope>,
    modules: Vec<Arc<dyn PluginModule>>,
    publisher: Arc<dyn AccessoryPublisher>,
    ports: RemotePortClient,
    loaded: Option<LoadedPlugin>,
    bridge: Arc<OnceLock<Arc<BridgeService>>>,
    started: bool,
    failures: mpsc::UnboundedSender<HannaError>,
}

impl ChildBridge {
    fn load(&mut self, mut payload: LoadPayload) -> Result<()> {
        for block in &mut payload.plugin_config {
            block.bridge = None;
        }

        let plugins = PluginManager::single(self.modules.iter().cloned(), &payload.plugin)?;
        let plugin = plugins
            .get_plugin(&payload.plugin)
            .ok_or_else(|| PluginError::Unavailable(payload.plugin.clone()))?;
        info!("Loaded plugin: {}@{}", plugin.identifier(), plugin.version());

        self.sender.send(Envelope::Loaded(LoadedPayload {
            version: plugin.version().to_string(),
        }))?;
        self.loaded = Some(LoadedPlugin {
            payload: Arc::new(payload),
            plugins: Arc::new(plugins),
        });
        Ok(())
    }

    fn start(&mut self) {
        let Some(loaded) = self.loaded.clone() else {
            warn!("Received START before LOAD, ignoring");
            return;
        };
        if self.started {
            debug!("Child bridge already started");
            return;
        }
        self.started = true;

        let sender = self.sender.clone();
        let publisher = Arc::clone(&self.publisher);
        let ports = self.ports.clone();
        let slot = Arc::clone(&self.bridge);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            match start_bridge(loaded, publisher, ports, slot).await {
                Ok(()) => {
                    if sender.send(Envelope::Online).is_err() {
                        debug!("Parent went away before ONLINE");
                    }
                }
                Err(e) => {
                    let _ = failures.send(e);
                }
            }
        });
    }

    async fn teardown(&self) {
        let Some(bridge) = self.bridge.get() else {
            return;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, bridge.teardown())
            .await
            .is_err()
        {
            warn!(
                "Child bridge did not shut down within {} seconds",
                SHUTDOWN_GRACE.as_secs()
            );
        }
    }
}

async fn start_bridge(
    loaded: LoadedPlugin,
    publisher: Arc<dyn AccessoryPublisher>,
    ports: RemotePortClient,
    slot: Arc<OnceLock<Arc<BridgeService>>>,
) -> Result<()> {
    let LoadedPlugin { payload, plugins } = loaded;
    let plugin = plugins
        .get_plugin(&payload.plugin)
        .ok_or_else(|| PluginError::Unavailable(payload.plugin.clone()))?;

    let (api, events) = HostApi::new();
    let service = Arc::new(BridgeService::new(
        api.clone(),
        Arc::clone(&plugins),
        PortService::Remote(ports),
        publisher,
        payload.bridge_options.clone(),
        payload.bridge_config.clone(),
    ));
    let _ = slot.set(Arc::clone(&service));

    service.load_cached_accessories().await;
    service.spawn_api_handler(events);

    let identifier = payload.identifier.as_str();
    match payload.kind {
        PluginKind::Platform => {
            for block in &payload.plugin_config {
                let constructor = plugin.platform_constructor(identifier)?;
                match constructor(block, &api) {
                    PlatformInstance::Dynamic(platform) => plugin.assign_dynamic_platform(identifier, platform),
                    PlatformInstance::Static(platform) => {
                        service
                            .load_platform_accessories(&plugin, platform, identifier)
                            .await
                    }
                    PlatformInstance::Independent => {}
                }
            }
        }
        PluginKind::Accessory => {
            for block in &payload.plugin_config {
                let Some(display_name) = block.name.as_deref() else {
                    warn!(
                        "Could not load accessory {} as it is missing the required 'name' property!",
                        identifier
                    );
                    continue;
                };
                let constructor = plugin.accessory_constructor(identifier)?;
                let instance = constructor(block, &api);
                let uuid_base = instance
                    .uuid_base()
                    .map(str::to_string)
                    .or_else(|| block.uuid_base.clone());
                match BridgeService::create_accessory(instance.as_ref(), display_name, identifier, uuid_base.as_deref()) {
                    Some(accessory) => {
                        if let Err(e) = service.add_bridged_accessory(accessory).await {
                            warn!("Could not add accessory {}: {}", display_name, e);
                        }
                    }
                    None => info!(
                        "Accessory {} returned empty set of services; not adding it to the bridge.",
                        identifier
                    ),
                }
            }
        }
    }

    service.restore_cached_accessories().await;
    service.publish_bridge().await?;
    api.signal_finished();
    Ok(())
}

/// Run the child side over `reader`/`writer` until the parent disconnects,
/// startup fails, or `shutdown` yields a signal number. Returns the process
/// exit code.
pub async fn run_child<R, W, S>(
    reader: R,
    writer: W,
    modules: Vec<Arc<dyn PluginModule>>,
    publisher: Arc<dyn AccessoryPublisher>,
    shutdown: S,
) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = i32>,
{
    let (sender, mut receiver) = MessageChannel::open::<Envelope, Envelope, _, _>(reader, writer, "parent");
    let (failures, mut failed) = mpsc::unbounded_channel();
    let mut child = ChildBridge {
        ports: RemotePortClient::new(sender.clone()),
        sender,
        modules,
        publisher,
        loaded: None,
        bridge: Arc::new(OnceLock::new()),
        started: false,
        failures,
    };

    if child.sender.send(Envelope::Ready).is_err() {
        error!("Parent process not connected, terminating process...");
        return EXIT_FAILURE;
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            message = receiver.recv() => match message {
                Some(Envelope::Load(payload)) => {
                    if let Err(e) = child.load(*payload) {
                        error!("Failed to load plugin for child bridge: {}", e);
                        return EXIT_FAILURE;
                    }
                }
                Some(Envelope::Start) => child.start(),
                Some(Envelope::PortAllocated(allocated)) => child.ports.handle_allocated(allocated),
                Some(other) => debug!(kind = other.kind(), "Ignoring unexpected message from parent"),
                None => {
                    error!("Parent process not connected, terminating process...");
                    return EXIT_FAILURE;
                }
            },
            Some(e) = failed.recv() => {
                error!("Failed to start child bridge: {}", e);
                return EXIT_FAILURE;
            }
            signal = &mut shutdown => {
                info!("Got {}, shutting down child bridge process...", signal_name(signal));
                child.teardown().await;
                return 128 + signal;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessory::PlatformAccessory;
    use crate::bridge::testing::RecordingPublisher;
    use crate::config::{BridgeConfig, BridgeOptions, ConfigBlock, HostConfig, HostOptions, PortConfig};
    use crate::env::StoragePaths;
    use crate::identity::BridgeIdentity;
    use crate::ipc::{ChannelReceiver, PortAllocated};
    use crate::api::Lifecycle;
    use crate::plugin::testing::{NamedAccessory, RecordingPlatform, TestModule};
    use crate::plugin::{
        AccessoriesFuture, AccessoryConstructor, AccessoryPlugin, PlatformConstructor, StaticPlatform,
    };
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{oneshot, watch};
    use tokio::task::JoinHandle;

    /// Platform that publishes one external accessory as soon as it is built.
    struct TvModule;

    impl PluginModule for TvModule {
        fn identifier(&self) -> &str {
            "hanna-tv"
        }

        fn version(&self) -> &str {
            "0.4.0"
        }

        fn path(&self) -> &Path {
            Path::new("/plugins/tv")
        }

        fn platform_constructor(&self, name: &str) -> Option<PlatformConstructor> {
            (name == "TV").then(|| {
                let constructor: PlatformConstructor = Arc::new(|_config: &ConfigBlock, api: &HostApi| {
                    api.publish_external_accessories("hanna-tv", vec![PlatformAccessory::new("Living TV", "tv-1")]);
                    PlatformInstance::Dynamic(Arc::new(RecordingPlatform::default()))
                });
                constructor
            })
        }

        fn accessory_constructor(&self, _name: &str) -> Option<AccessoryConstructor> {
            None
        }
    }

    /// Static platform that records the launch phase it finished loading in.
    struct ClockModule {
        observed: Arc<Mutex<Vec<Lifecycle>>>,
    }

    struct ClockPlatform {
        lifecycle: watch::Receiver<Lifecycle>,
        observed: Arc<Mutex<Vec<Lifecycle>>>,
    }

    impl StaticPlatform for ClockPlatform {
        fn accessories(&self) -> AccessoriesFuture {
            let lifecycle = self.lifecycle.clone();
            let observed = Arc::clone(&self.observed);
            Box::pin(async move {
                tokio::task::yield_now().await;
                observed.lock().unwrap().push(*lifecycle.borrow());
                vec![Box::new(NamedAccessory {
                    name: "Hall Clock".into(),
                    services: 1,
                }) as Box<dyn AccessoryPlugin>]
            })
        }
    }

    impl PluginModule for ClockModule {
        fn identifier(&self) -> &str {
            "hanna-clock"
        }

        fn version(&self) -> &str {
            "2.0.0"
        }

        fn path(&self) -> &Path {
            Path::new("/plugins/clock")
        }

        fn platform_constructor(&self, name: &str) -> Option<PlatformConstructor> {
            let observed = Arc::clone(&self.observed);
            (name == "Clock").then(|| {
                let constructor: PlatformConstructor = Arc::new(move |_config: &ConfigBlock, api: &HostApi| {
                    PlatformInstance::Static(Box::new(ClockPlatform {
                        lifecycle: api.lifecycle(),
                        observed: Arc::clone(&observed),
                    }))
                });
                constructor
            })
        }

        fn accessory_constructor(&self, _name: &str) -> Option<AccessoryConstructor> {
            None
        }
    }

    struct Harness {
        clock_observed: Arc<Mutex<Vec<Lifecycle>>>,
        _dir: tempfile::TempDir,
        dir: PathBuf,
        host_tx: ChannelSender<Envelope>,
        host_rx: ChannelReceiver<Envelope>,
        signal: Option<oneshot::Sender<i32>>,
        publisher: Arc<RecordingPublisher>,
        child: JoinHandle<i32>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (host_io, child_io) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        let (child_read, child_write) = tokio::io::split(child_io);
        let (host_tx, host_rx) = MessageChannel::open::<Envelope, Envelope, _, _>(host_read, host_write, "host");

        let clock_observed = Arc::new(Mutex::new(Vec::new()));
        let modules = vec![
            TestModule::new("hanna-fan").accessory("Fan").into_module(),
            Arc::new(TvModule) as Arc<dyn PluginModule>,
            Arc::new(ClockModule {
                observed: Arc::clone(&clock_observed),
            }) as Arc<dyn PluginModule>,
        ];
        let publisher = Arc::new(RecordingPublisher::default());
        let (signal, signal_rx) = oneshot::channel::<i32>();
        let child = tokio::spawn(run_child(
            child_read,
            child_write,
            modules,
            publisher.clone(),
            async move { signal_rx.await.unwrap_or(15) },
        ));
        Harness {
            clock_observed,
            dir: dir.path().to_path_buf(),
            _dir: dir,
            host_tx,
            host_rx,
            signal: Some(signal),
            publisher,
            child,
        }
    }

    fn payload(dir: &Path, kind: PluginKind, identifier: &str, plugin: &str, names: &[&str]) -> LoadPayload {
        let identity = BridgeIdentity::parse("0E:00:00:00:00:05").unwrap();
        let mut host_config = HostConfig::default();
        host_config.ports = Some(PortConfig {
            start: Some(7000),
            end: Some(7010),
        });
        LoadPayload {
            kind,
            identifier: identifier.to_string(),
            plugin: plugin.to_string(),
            plugin_path: PathBuf::from("/plugins/test"),
            plugin_config: names
                .iter()
                .map(|name| ConfigBlock {
                    accessory: (kind == PluginKind::Accessory).then(|| identifier.to_string()),
                    platform: (kind == PluginKind::Platform).then(|| identifier.to_string()),
                    name: Some(name.to_string()),
                    bridge: Some(BridgeConfig {
                        username: identity.to_string(),
                        ..BridgeConfig::default()
                    }),
                    ..ConfigBlock::default()
                })
                .collect(),
            bridge_config: BridgeConfig {
                name: Some("Fans".into()),
                username: identity.to_string(),
                pin: Some("031-45-154".into()),
                ..BridgeConfig::default()
            },
            bridge_options: BridgeOptions::child(HostOptions::default(), &StoragePaths::at(dir), &identity),
            host_config: host_config.child_subset(),
        }
    }

    #[tokio::test]
    async fn handshake_then_signal_exit() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));

        let load = payload(&h.dir, PluginKind::Accessory, "Fan", "hanna-fan", &["Desk", "Floor"]);
        h.host_tx.send(Envelope::Load(Box::new(load))).unwrap();
        assert_eq!(
            h.host_rx.recv().await,
            Some(Envelope::Loaded(LoadedPayload {
                version: "1.2.3".into()
            }))
        );

        h.host_tx.send(Envelope::Start).unwrap();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Online));
        {
            let bridges = h.publisher.bridges.lock().unwrap();
            assert_eq!(bridges.len(), 1);
            assert_eq!(bridges[0].0, 2);
            assert_eq!(bridges[0].1.pincode, "031-45-154");
        }

        h.signal.take().unwrap().send(15).unwrap();
        assert_eq!(h.child.await.unwrap(), 143);
        assert!(h
            .dir
            .join("accessories")
            .join("cachedAccessories.0E0000000005")
            .exists());
    }

    #[tokio::test]
    async fn external_accessory_port_comes_from_parent() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));
        h.host_tx
            .send(Envelope::Load(Box::new(payload(&h.dir, PluginKind::Platform, "TV", "hanna-tv", &["Lounge"]))))
            .unwrap();
        assert!(matches!(h.host_rx.recv().await, Some(Envelope::Loaded(_))));
        h.host_tx.send(Envelope::Start).unwrap();

        let mut online = false;
        let mut allocated = false;
        while !(online && allocated) {
            match h.host_rx.recv().await {
                Some(Envelope::Online) => online = true,
                Some(Envelope::PortRequest(request)) => {
                    assert_eq!(request.username, BridgeIdentity::derive("tv-1"));
                    h.host_tx
                        .send(Envelope::PortAllocated(PortAllocated {
                            username: request.username,
                            port: Some(7003),
                        }))
                        .unwrap();
                    allocated = true;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }

        for _ in 0..100 {
            if !h.publisher.external.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let external = h.publisher.external.lock().unwrap().clone();
        assert_eq!(external.len(), 1);
        assert_eq!(external[0].1.port, Some(7003));
    }

    #[tokio::test]
    async fn static_platform_loads_before_launch_finishes() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));
        h.host_tx
            .send(Envelope::Load(Box::new(payload(
                &h.dir,
                PluginKind::Platform,
                "Clock",
                "hanna-clock",
                &["Hall", "Kitchen"],
            ))))
            .unwrap();
        assert!(matches!(h.host_rx.recv().await, Some(Envelope::Loaded(_))));
        h.host_tx.send(Envelope::Start).unwrap();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Online));

        assert_eq!(
            *h.clock_observed.lock().unwrap(),
            vec![Lifecycle::Launching, Lifecycle::Launching]
        );
        let bridges = h.publisher.bridges.lock().unwrap();
        assert_eq!(bridges.len(), 1);
        // Both platforms return the same accessory; the second is refused as a duplicate.
        assert_eq!(bridges[0].0, 1);
    }

    #[tokio::test]
    async fn accessory_without_name_is_skipped() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));
        let mut load = payload(&h.dir, PluginKind::Accessory, "Fan", "hanna-fan", &["Desk", "Floor"]);
        load.plugin_config[1].name = None;
        h.host_tx.send(Envelope::Load(Box::new(load))).unwrap();
        assert!(matches!(h.host_rx.recv().await, Some(Envelope::Loaded(_))));
        h.host_tx.send(Envelope::Start).unwrap();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Online));

        let bridges = h.publisher.bridges.lock().unwrap();
        assert_eq!(bridges[0].0, 1);
    }

    #[tokio::test]
    async fn parent_disconnect_exits_with_failure() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));
        drop(h.host_tx);
        assert_eq!(h.child.await.unwrap(), EXIT_FAILURE);
    }

    #[tokio::test]
    async fn unknown_plugin_exits_with_failure() {
        let mut h = harness();
        assert_eq!(h.host_rx.recv().await, Some(Envelope::Ready));
        h.host_tx
            .send(Envelope::Load(Box::new(payload(&h.dir, PluginKind::Platform, "Gone", "hanna-gone", &[]))))
            .unwrap();
        assert_eq!(h.child.await.unwrap(), EXIT_FAILURE);
    }

    #[test]
    fn signal_names() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(2), "SIGINT");
        assert_eq!(signal_name(1), "signal 1");
    }
}
