use crate::env::StoragePaths;
use crate::identity::{BridgeIdentity, InvalidIdentity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_BRIDGE_NAME: &str = "Hanna";
pub const DEFAULT_BRIDGE_USERNAME: &str = "C1:F2:D3:69:CE:30";
pub const DEFAULT_BRIDGE_PIN: &str = "031-20-021";
pub const ADVERTISER_BONJOUR: &str = "bonjour-hap";
pub const ADVERTISER_CIAO: &str = "ciao";

/// Main bridge cache item; child bridges append their compact identity.
pub const CACHED_ACCESSORIES_ITEM: &str = "cachedAccessories";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("there was a problem reading {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("main bridge {0}")]
    MainIdentity(#[source] InvalidIdentity),

    #[error("error loading the {kind} \"{identifier}\" requested in your config.json - {source}")]
    InvalidIdentity {
        kind: PluginKind,
        identifier: String,
        #[source]
        source: InvalidIdentity,
    },

    #[error("error loading the {kind} \"{identifier}\" requested in your config.json - duplicate username found in _bridge.username: \"{identity}\". Each platform child bridge must have its own unique username")]
    DuplicatePlatformIdentity {
        kind: PluginKind,
        identifier: String,
        identity: BridgeIdentity,
    },

    #[error("error loading the {kind} \"{identifier}\" requested in your config.json - duplicate username found in _bridge.username: \"{identity}\". You can only group accessories of the same type in a child bridge")]
    MixedAccessoryGroup {
        kind: PluginKind,
        identifier: String,
        identity: BridgeIdentity,
    },

    #[error("error loading the {kind} \"{identifier}\" requested in your config.json - username found in _bridge.username: \"{identity}\" is the same as the main bridge. Each child bridge platform/accessory must have its own unique username")]
    CollidesWithMainBridge {
        kind: PluginKind,
        identifier: String,
        identity: BridgeIdentity,
    },
}

/// Logical kind of a plugin entry (and of a child bridge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PluginKind {
    Platform,
    Accessory,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Platform => "platform",
            PluginKind::Accessory => "accessory",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bridge section of `config.json`, also used for the `_bridge` block of
/// entries that run in a child bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertiser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Interface name(s) or address(es); passed through to the protocol runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<Value>,
    #[serde(rename = "setupID", default, skip_serializing_if = "Option::is_none")]
    pub setup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_ipc: bool,
}

impl BridgeConfig {
    pub fn default_main() -> Self {
        Self {
            name: Some(DEFAULT_BRIDGE_NAME.to_string()),
            username: DEFAULT_BRIDGE_USERNAME.to_string(),
            pin: Some(DEFAULT_BRIDGE_PIN.to_string()),
            advertiser: Some(ADVERTISER_BONJOUR.to_string()),
            ..Self::default()
        }
    }
}

/// One `platforms[]` or `accessories[]` entry. Fields the host does not
/// interpret are kept in `fields` and handed to the plugin untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigBlock {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid_base: Option<String>,
    #[serde(rename = "_bridge", default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeConfig>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ConfigBlock {
    /// Platform or accessory identifier, depending on the kind of list the
    /// block came from.
    pub fn identifier(&self, kind: PluginKind) -> Option<&str> {
        match kind {
            PluginKind::Platform => self.platform.as_deref(),
            PluginKind::Accessory => self.accessory.as_deref(),
        }
    }
}

/// Raw `ports` section; both bounds are required for it to take effect.
/// Bounds are kept wide so values outside the port space reach
/// [`HostConfig::normalize`] instead of failing the whole parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

/// Inclusive port range handed out to external accessories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }
}

impl PortConfig {
    pub fn range(&self) -> Option<PortRange> {
        let start = u16::try_from(self.start?).ok()?;
        let end = u16::try_from(self.end?).ok()?;
        PortRange::new(start, end)
    }
}

/// Parsed `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default = "BridgeConfig::default_main")]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub accessories: Vec<ConfigBlock>,
    #[serde(default)]
    pub platforms: Vec<ConfigBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default_main(),
            accessories: Vec::new(),
            platforms: Vec::new(),
            plugins: None,
            disabled_plugins: None,
            ports: None,
        }
    }
}

impl HostConfig {
    /// Load and normalise `config.json`. A missing file yields the default
    /// configuration; an unreadable or malformed one is fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("config.json ({}) not found.", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let config = config.normalize()?;
        info!(
            "Loaded config.json with {} accessories and {} platforms.",
            config.accessories.len(),
            config.platforms.len()
        );
        Ok(config)
    }

    /// Fill bridge defaults, validate the main identity, drop an unusable
    /// port pool and reset an unknown advertiser.
    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        if let Some(ports) = self.ports {
            let in_port_space = |port: i64| u16::try_from(port).is_ok();
            match (ports.start, ports.end) {
                (Some(start), Some(end)) if !in_port_space(start) || !in_port_space(end) => {
                    error!("Invalid port pool configuration. Ports must be between 0 and 65535. Ignoring it!");
                    self.ports = None;
                }
                (Some(start), Some(end)) if start > end => {
                    error!("Invalid port pool configuration. End should be greater than or equal to start.");
                    self.ports = None;
                }
                (Some(_), Some(_)) => {}
                _ => {
                    error!("Invalid configuration for 'ports'. Missing 'start' and 'end' properties! Ignoring it!");
                    self.ports = None;
                }
            }
        }

        let bridge = &mut self.bridge;
        if bridge.name.as_deref().map_or(true, str::is_empty) {
            bridge.name = Some(DEFAULT_BRIDGE_NAME.to_string());
        }
        if bridge.username.is_empty() {
            bridge.username = DEFAULT_BRIDGE_USERNAME.to_string();
        }
        if bridge.pin.as_deref().map_or(true, str::is_empty) {
            bridge.pin = Some(DEFAULT_BRIDGE_PIN.to_string());
        }

        let identity = BridgeIdentity::parse(&bridge.username).map_err(ConfigError::MainIdentity)?;
        bridge.username = identity.to_string();

        match bridge.advertiser.as_deref() {
            Some(ADVERTISER_BONJOUR) | Some(ADVERTISER_CIAO) => {}
            Some(_) => {
                error!("Value provided in bridge.advertiser is not valid, reverting to \"{ADVERTISER_BONJOUR}\".");
                bridge.advertiser = Some(ADVERTISER_BONJOUR.to_string());
            }
            None => bridge.advertiser = Some(ADVERTISER_BONJOUR.to_string()),
        }

        Ok(self)
    }

    pub fn main_identity(&self) -> Option<BridgeIdentity> {
        BridgeIdentity::parse(&self.bridge.username).ok()
    }

    pub fn port_range(&self) -> Option<PortRange> {
        self.ports.and_then(|ports| ports.range())
    }

    /// Blocks of `kind` for `identifier` whose `_bridge.username` is
    /// `identity`, in file order.
    pub fn child_bridge_blocks(
        &self,
        kind: PluginKind,
        identifier: &str,
        identity: &BridgeIdentity,
    ) -> Vec<ConfigBlock> {
        let list = match kind {
            PluginKind::Platform => &self.platforms,
            PluginKind::Accessory => &self.accessories,
        };
        list.iter()
            .filter(|block| block.identifier(kind) == Some(identifier))
            .filter(|block| {
                block
                    .bridge
                    .as_ref()
                    .and_then(|bridge| BridgeIdentity::parse(&bridge.username).ok())
                    .as_ref()
                    == Some(identity)
            })
            .cloned()
            .collect()
    }

    /// The part of the host configuration a child bridge needs.
    pub fn child_subset(&self) -> Self {
        Self {
            bridge: self.bridge.clone(),
            ports: self.ports,
            disabled_plugins: Some(Vec::new()),
            ..Self::default()
        }
    }
}

/// Runtime options taken from the command line; shared with child bridges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostOptions {
    #[serde(default)]
    pub keep_orphaned_cached_accessories: bool,
    #[serde(default, rename = "hideQRCode")]
    pub hide_qr_code: bool,
    #[serde(default)]
    pub insecure_access: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_plugin_path: Option<PathBuf>,
    #[serde(default)]
    pub no_log_timestamps: bool,
    #[serde(default)]
    pub debug_mode_enabled: bool,
    #[serde(default)]
    pub force_colour_logging: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_storage_path: Option<PathBuf>,
}

impl HostOptions {
    /// Command-line flags forwarded to a child bridge process.
    pub fn child_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.debug_mode_enabled {
            args.push("-D".to_string());
        }
        if self.force_colour_logging {
            args.push("-C".to_string());
        }
        if self.insecure_access {
            args.push("-I".to_string());
        }
        if self.no_log_timestamps {
            args.push("-T".to_string());
        }
        if self.keep_orphaned_cached_accessories {
            args.push("-K".to_string());
        }
        if let Some(path) = &self.custom_storage_path {
            args.push("-U".to_string());
            args.push(path.display().to_string());
        }
        if let Some(path) = &self.custom_plugin_path {
            args.push("-P".to_string());
            args.push(path.display().to_string());
        }
        args
    }
}

/// Options of one bridge (main or child): host options plus where its
/// accessory cache lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeOptions {
    #[serde(flatten)]
    pub host: HostOptions,
    pub cached_accessories_dir: PathBuf,
    pub cached_accessories_item_name: String,
}

impl BridgeOptions {
    pub fn main(host: HostOptions, paths: &StoragePaths) -> Self {
        Self {
            host,
            cached_accessories_dir: paths.accessory_path(),
            cached_accessories_item_name: CACHED_ACCESSORIES_ITEM.to_string(),
        }
    }

    pub fn child(host: HostOptions, paths: &StoragePaths, identity: &BridgeIdentity) -> Self {
        Self {
            host,
            cached_accessories_dir: paths.accessory_path(),
            cached_accessories_item_name: format!(
                "{CACHED_ACCESSORIES_ITEM}.{}",
                identity.compact()
            ),
        }
    }

    pub fn keep_orphans(&self) -> bool {
        self.host.keep_orphaned_cached_accessories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(json: &str) -> HostConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn missing_file_yields_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.bridge.username, DEFAULT_BRIDGE_USERNAME);
        assert!(config.platforms.is_empty());
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"{ not json").unwrap();
        assert!(matches!(
            HostConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn normalize_fills_bridge_defaults_and_upper_cases() {
        let config = parse(r#"{"bridge": {"username": "aa:bb:cc:dd:ee:ff"}}"#)
            .normalize()
            .unwrap();
        assert_eq!(config.bridge.username, "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.bridge.name.as_deref(), Some(DEFAULT_BRIDGE_NAME));
        assert_eq!(config.bridge.pin.as_deref(), Some(DEFAULT_BRIDGE_PIN));
        assert_eq!(config.bridge.advertiser.as_deref(), Some(ADVERTISER_BONJOUR));
    }

    #[test]
    fn normalize_rejects_invalid_main_identity() {
        let result = parse(r#"{"bridge": {"username": "not-a-mac"}}"#).normalize();
        assert!(matches!(result, Err(ConfigError::MainIdentity(_))));
    }

    #[test]
    fn inverted_or_partial_port_pool_is_dropped() {
        let inverted = parse(r#"{"ports": {"start": 7010, "end": 7000}}"#)
            .normalize()
            .unwrap();
        assert!(inverted.ports.is_none());

        let partial = parse(r#"{"ports": {"start": 7010}}"#).normalize().unwrap();
        assert!(partial.ports.is_none());

        let out_of_range = parse(r#"{"ports": {"start": 65000, "end": 70000}}"#)
            .normalize()
            .unwrap();
        assert!(out_of_range.ports.is_none());
        assert_eq!(out_of_range.port_range(), None);

        let negative = parse(r#"{"ports": {"start": -1, "end": 7000}}"#)
            .normalize()
            .unwrap();
        assert!(negative.ports.is_none());

        let valid = parse(r#"{"ports": {"start": 7000, "end": 7002}}"#)
            .normalize()
            .unwrap();
        assert_eq!(valid.port_range(), PortRange::new(7000, 7002));
    }

    #[test]
    fn unknown_advertiser_reverts_to_bonjour() {
        let config = parse(r#"{"bridge": {"username": "AA:BB:CC:DD:EE:FF", "advertiser": "avahi"}}"#)
            .normalize()
            .unwrap();
        assert_eq!(config.bridge.advertiser.as_deref(), Some(ADVERTISER_BONJOUR));
    }

    #[test]
    fn config_block_keeps_plugin_fields() {
        let config = parse(
            r#"{"platforms": [{"platform": "Lights", "name": "Hall", "token": "abc",
                 "_bridge": {"username": "0E:00:00:00:00:01"}}]}"#,
        );
        let block = &config.platforms[0];
        assert_eq!(block.identifier(PluginKind::Platform), Some("Lights"));
        assert_eq!(block.fields.get("token"), Some(&Value::from("abc")));
        assert_eq!(
            block.bridge.as_ref().map(|b| b.username.as_str()),
            Some("0E:00:00:00:00:01")
        );
    }

    #[test]
    fn child_bridge_blocks_filter_by_identifier_and_identity() {
        let config = parse(
            r#"{"accessories": [
                {"accessory": "Fan", "name": "A", "_bridge": {"username": "0e:00:00:00:00:01"}},
                {"accessory": "Fan", "name": "B", "_bridge": {"username": "0E:00:00:00:00:02"}},
                {"accessory": "Lamp", "name": "C", "_bridge": {"username": "0E:00:00:00:00:01"}},
                {"accessory": "Fan", "name": "D"}
            ]}"#,
        );
        let identity = BridgeIdentity::parse("0E:00:00:00:00:01").unwrap();
        let blocks = config.child_bridge_blocks(PluginKind::Accessory, "Fan", &identity);
        let names: Vec<_> = blocks.iter().filter_map(|b| b.name.as_deref()).collect();
        assert_eq!(names, vec!["A"]);
    }

    #[test]
    fn child_args_mirror_host_options() {
        let options = HostOptions {
            debug_mode_enabled: true,
            keep_orphaned_cached_accessories: true,
            custom_storage_path: Some(PathBuf::from("/tmp/store")),
            ..HostOptions::default()
        };
        assert_eq!(options.child_args(), vec!["-D", "-K", "-U", "/tmp/store"]);
    }

    #[test]
    fn child_cache_item_uses_compact_identity() {
        let identity = BridgeIdentity::parse("0e:3a:1f:00:ab:12").unwrap();
        let options = BridgeOptions::child(
            HostOptions::default(),
            &StoragePaths::at("/srv/hanna"),
            &identity,
        );
        assert_eq!(options.cached_accessories_item_name, "cachedAccessories.0E3A1F00AB12");
        assert_eq!(options.cached_accessories_dir, PathBuf::from("/srv/hanna/accessories"));
    }
}
