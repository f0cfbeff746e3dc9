//! Child bridge supervision.
//!
//! One [`ChildBridgeService`] per configured child bridge keeps exactly one
//! child process alive: spawn, drive the handshake, serve port requests,
//! restart after a crash, terminate on shutdown.

pub mod handshake;
pub mod spawner;
pub mod status;

pub use handshake::{Handshake, HandshakeAction, HandshakeStage};
pub use spawner::{ChildExit, ChildSpawner, ProcessSpawner, SpawnedChild, SHUTDOWN_GRACE};
pub use status::{ChildMetadata, ChildStatus, StatusTransition};

use crate::config::{BridgeConfig, BridgeOptions, ConfigBlock, ConfigError, HostConfig, HostOptions, PluginKind};
use crate::control::ControlEvent;
use crate::env::StoragePaths;
use crate::identity::BridgeIdentity;
use crate::ipc::{ChannelSender, Envelope, LoadPayload, PortAllocated};
use crate::plugin::Plugin;
use crate::ports::PortPool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Fixed delay before a crashed child is spawned again.
pub const RESTART_DELAY: Duration = Duration::from_secs(7);

/// Host-wide collaborators shared by every child bridge supervisor.
#[derive(Clone)]
pub struct SupervisorContext {
    pub host_config: Arc<HostConfig>,
    pub options: HostOptions,
    pub paths: StoragePaths,
    pub ports: Arc<PortPool>,
    pub spawner: Arc<dyn ChildSpawner>,
    pub events: broadcast::Sender<ControlEvent>,
    /// Flips to `true` once host shutdown has begun.
    pub shutdown: watch::Receiver<bool>,
}

struct ChildState {
    status: ChildStatus,
    pid: Option<u32>,
    bridge_config: BridgeConfig,
    plugin_config: Vec<ConfigBlock>,
    display_name: Option<String>,
    terminate: Option<oneshot::Sender<()>>,
}

struct Inner {
    kind: PluginKind,
    identifier: String,
    identity: BridgeIdentity,
    plugin: Arc<Plugin>,
    context: SupervisorContext,
    state: Mutex<ChildState>,
}

#[derive(Clone)]
pub struct ChildBridgeService {
    inner: Arc<Inner>,
}

impl ChildBridgeService {
    pub fn new(
        kind: PluginKind,
        identifier: impl Into<String>,
        identity: BridgeIdentity,
        plugin: Arc<Plugin>,
        bridge_config: BridgeConfig,
        context: SupervisorContext,
    ) -> Self {
        let state = ChildState {
            status: ChildStatus::Pending,
            pid: None,
            bridge_config,
            plugin_config: Vec::new(),
            display_name: None,
            terminate: None,
        };
        Self {
            inner: Arc::new(Inner {
                kind,
                identifier: identifier.into(),
                identity,
                plugin,
                context,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn identity(&self) -> &BridgeIdentity {
        &self.inner.identity
    }

    pub fn kind(&self) -> PluginKind {
        self.inner.kind
    }

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.inner.plugin
    }

    fn state(&self) -> MutexGuard<'_, ChildState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a config block while the host configuration is being loaded.
    pub fn add_config(&self, block: ConfigBlock) {
        self.state().plugin_config.push(block);
    }

    pub fn plugin_config(&self) -> Vec<ConfigBlock> {
        self.state().plugin_config.clone()
    }

    pub fn status(&self) -> ChildStatus {
        self.state().status
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.context.shutdown.borrow()
    }

    fn bridge_name(&self, state: &ChildState) -> String {
        state
            .bridge_config
            .name
            .clone()
            .or_else(|| state.display_name.clone())
            .unwrap_or_else(|| self.inner.plugin.identifier().to_string())
    }

    fn snapshot(&self, state: &ChildState) -> ChildMetadata {
        ChildMetadata {
            status: state.status,
            username: self.inner.identity.clone(),
            name: self.bridge_name(state),
            plugin: self.inner.plugin.identifier().to_string(),
            kind: self.inner.kind,
            identifier: self.inner.identifier.clone(),
            pid: state.pid,
        }
    }

    pub fn metadata(&self) -> ChildMetadata {
        let state = self.state();
        self.snapshot(&state)
    }

    /// Record `status` and broadcast it. Repeating the current status is a
    /// no-op.
    fn set_status(&self, status: ChildStatus) {
        let transition = {
            let mut state = self.state();
            if state.status == status {
                return;
            }
            let transition = self.snapshot(&state).transition(status);
            state.status = transition.metadata.status;
            transition
        };
        // No subscribers is fine; the event is only for control clients.
        let _ = self.inner.context.events.send(transition.event);
    }

    /// Start supervising: spawn the child now and again after every exit
    /// until host shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        {
            let mut state = self.state();
            let display_name = match state.plugin_config.as_slice() {
                [single] => single.name.clone(),
                _ => None,
            };
            state.display_name =
                Some(display_name.unwrap_or_else(|| self.inner.plugin.identifier().to_string()));
        }
        tokio::spawn(self.clone().supervise())
    }

    async fn supervise(self) {
        let mut shutdown = self.inner.context.shutdown.clone();
        loop {
            if self.is_shutting_down() {
                break;
            }
            self.set_status(ChildStatus::Spawning);
            let args = self.inner.context.options.child_args();
            match self.inner.context.spawner.spawn(&args) {
                Ok(child) => {
                    let exit = self.run_child(child).await;
                    warn!(
                        "[{}] Child bridge process ended. Code: {:?}, Signal: {:?}",
                        self.inner.identity, exit.code, exit.signal
                    );
                }
                Err(e) => {
                    error!(
                        "[{}] Failed to start child bridge process: {}",
                        self.inner.identity, e
                    );
                    self.set_status(ChildStatus::Down);
                }
            }

            if self.is_shutting_down() {
                break;
            }
            warn!(
                "[{}] Restarting the process in {} seconds...",
                self.inner.identity,
                RESTART_DELAY.as_secs()
            );
            tokio::select! {
                _ = tokio::time::sleep(RESTART_DELAY) => {}
                _ = shutdown.wait_for(|down| *down) => break,
            }
        }
        debug!(identity = %self.inner.identity, "Child bridge supervisor finished");
    }

    async fn run_child(&self, child: SpawnedChild) -> ChildExit {
        let SpawnedChild {
            pid,
            sender,
            mut receiver,
            terminate,
            mut exited,
        } = child;

        {
            let mut state = self.state();
            state.pid = pid;
            state.terminate = Some(terminate);
        }
        info!("[{}] Launched child bridge with PID {:?}", self.inner.identity, pid);
        self.set_status(ChildStatus::Pending);

        let mut shutdown = self.inner.context.shutdown.clone();
        let mut stopping = false;
        let mut handshake = Handshake::new();
        let exit = loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(message) => self.handle_message(&mut handshake, &sender, message),
                    None => break (&mut exited).await.unwrap_or_default(),
                },
                exit = &mut exited => break exit.unwrap_or_default(),
                _ = async { let _ = shutdown.wait_for(|down| *down).await; }, if !stopping => {
                    stopping = true;
                    self.teardown();
                }
            }
        };

        {
            let mut state = self.state();
            state.pid = None;
            state.terminate = None;
        }
        self.set_status(ChildStatus::Down);
        exit
    }

    fn handle_message(&self, handshake: &mut Handshake, sender: &ChannelSender<Envelope>, message: Envelope) {
        let kind = message.kind();
        let reply = match handshake.on_message(message) {
            HandshakeAction::SendLoad => Some(Envelope::Load(Box::new(self.load_payload()))),
            HandshakeAction::SendStart { version } => {
                info!(
                    "[{}] Loaded {} v{} child bridge successfully",
                    self.inner.identity,
                    self.inner.plugin.identifier(),
                    version
                );
                Some(Envelope::Start)
            }
            HandshakeAction::MarkOnline => {
                self.set_status(ChildStatus::Ok);
                None
            }
            HandshakeAction::AllocatePort(request) => {
                let port = self.inner.context.ports.request_port(&request.username);
                Some(Envelope::PortAllocated(PortAllocated {
                    username: request.username,
                    port,
                }))
            }
            HandshakeAction::Ignore => {
                debug!(identity = %self.inner.identity, kind, "Ignoring out-of-order child message");
                None
            }
        };

        if let Some(reply) = reply {
            if sender.send(reply).is_err() {
                debug!(identity = %self.inner.identity, "Child channel closed before reply");
            }
        }
    }

    /// Configuration bundle sent in `LOAD`. Bridge settings the child entry
    /// leaves out fall back to the main bridge's.
    pub fn load_payload(&self) -> LoadPayload {
        let state = self.state();
        let own = &state.bridge_config;
        let host = &self.inner.context.host_config;
        let bridge_config = BridgeConfig {
            name: Some(self.bridge_name(&state)),
            username: self.inner.identity.to_string(),
            pin: own.pin.clone().or_else(|| host.bridge.pin.clone()),
            advertiser: host.bridge.advertiser.clone(),
            port: own.port,
            bind: host.bridge.bind.clone(),
            setup_id: own.setup_id.clone(),
            manufacturer: own
                .manufacturer
                .clone()
                .or_else(|| host.bridge.manufacturer.clone()),
            model: own.model.clone().or_else(|| host.bridge.model.clone()),
            disable_ipc: false,
        };

        LoadPayload {
            kind: self.inner.kind,
            identifier: self.inner.identifier.clone(),
            plugin: self.inner.plugin.identifier().to_string(),
            plugin_path: self.inner.plugin.path(),
            plugin_config: state.plugin_config.clone(),
            bridge_config,
            bridge_options: BridgeOptions::child(
                self.inner.context.options.clone(),
                &self.inner.context.paths,
                &self.inner.identity,
            ),
            host_config: host.child_subset(),
        }
    }

    /// Ask the running child to terminate. Does not wait for it to exit.
    pub fn teardown(&self) {
        let terminate = self.state().terminate.take();
        if let Some(terminate) = terminate {
            self.set_status(ChildStatus::Down);
            let _ = terminate.send(());
        }
    }

    /// Reload this bridge's config blocks and restart the child with them.
    pub async fn restart_bridge(&self) {
        warn!("[{}] Restarting child bridge...", self.inner.identity);
        self.refresh_config().await;
        self.teardown();
    }

    pub async fn refresh_config(&self) {
        match self.read_config_blocks().await {
            Ok(blocks) if !blocks.is_empty() => {
                let mut state = self.state();
                if let Some(mut bridge) = blocks[0].bridge.clone() {
                    bridge.username = self.inner.identity.to_string();
                    state.bridge_config = bridge;
                }
                state.plugin_config = blocks;
            }
            Ok(_) => warn!(
                "[{}] Platform/Accessory config could not be found, using existing config.",
                self.inner.identity
            ),
            Err(e) => error!(
                "[{}] Failed to refresh plugin config: {}",
                self.inner.identity, e
            ),
        }
    }

    async fn read_config_blocks(&self) -> Result<Vec<ConfigBlock>, ConfigError> {
        let path = self.inner.context.paths.config_path();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        let config: HostConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse { path, source })?;
        Ok(config.child_bridge_blocks(self.inner.kind, &self.inner.identifier, &self.inner.identity))
    }
}
