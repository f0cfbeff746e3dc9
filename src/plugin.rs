//! Plugin capability model.
//!
//! Finding and loading plugin code is up to the embedding application: it
//! hands the host a set of [`PluginModule`] values. The host only looks up
//! constructors and tracks which dynamic platforms are active.

use crate::accessory::PlatformAccessory;
use crate::api::HostApi;
use crate::config::{ConfigBlock, PluginKind};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{error, info, warn};

const PLUGIN_PREFIX: &str = "hanna-";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("no plugin was found for the {kind} \"{name}\" in your config.json. Please make sure the corresponding plugin is installed correctly.")]
    NotFound { kind: PluginKind, name: String },

    #[error("the requested {kind} \"{name}\" has been registered multiple times. Please be more specific by writing one of: {}", .candidates.join(", "))]
    Ambiguous {
        kind: PluginKind,
        name: String,
        candidates: Vec<String>,
    },

    #[error("the requested {kind} '{name}' was not registered by the plugin '{plugin}'.")]
    NotRegistered {
        kind: PluginKind,
        name: String,
        plugin: String,
    },

    #[error("the plugin '{0}' is not available in this process")]
    Unavailable(String),

    #[error("found multiple plugins with an active dynamic platform named '{platform}': {}", .plugins.join(", "))]
    AmbiguousDynamicPlatform {
        platform: String,
        plugins: Vec<String>,
    },
}

/// Accessory instance created by an accessory plugin or a static platform.
pub trait AccessoryPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Optional stable base for the accessory id; defaults to the name.
    fn uuid_base(&self) -> Option<&str> {
        None
    }

    /// Service definitions for the protocol runtime. An accessory without
    /// services is not added to a bridge.
    fn services(&self) -> Vec<Value>;
}

/// Platform that adds and removes accessories at runtime. Accessories it
/// created before are handed back from the cache at startup.
pub trait DynamicPlatform: Send + Sync {
    fn configure_accessory(&self, accessory: &PlatformAccessory);
}

pub type AccessoryList = Vec<Box<dyn AccessoryPlugin>>;
pub type AccessoriesFuture = Pin<Box<dyn Future<Output = AccessoryList> + Send>>;

/// Platform that produces a fixed accessory list once at startup.
pub trait StaticPlatform: Send + Sync {
    fn accessories(&self) -> AccessoriesFuture;
}

/// Result of constructing a platform.
pub enum PlatformInstance {
    Dynamic(Arc<dyn DynamicPlatform>),
    Static(Box<dyn StaticPlatform>),
    /// Neither restores nor lists accessories; it runs on its own.
    Independent,
}

pub type PlatformConstructor =
    Arc<dyn Fn(&ConfigBlock, &HostApi) -> PlatformInstance + Send + Sync>;
pub type AccessoryConstructor =
    Arc<dyn Fn(&ConfigBlock, &HostApi) -> Box<dyn AccessoryPlugin> + Send + Sync>;

/// A loaded plugin as seen by the host.
pub trait PluginModule: Send + Sync {
    /// Fully qualified identifier, e.g. `@scope/hanna-lights`.
    fn identifier(&self) -> &str;

    fn version(&self) -> &str;

    fn path(&self) -> &Path;

    fn platform_constructor(&self, name: &str) -> Option<PlatformConstructor>;

    fn accessory_constructor(&self, name: &str) -> Option<AccessoryConstructor>;
}

/// `plugin.Name` → `Name`; an unqualified identifier is returned as is.
pub fn local_name(identifier: &str) -> &str {
    match identifier.split_once('.') {
        Some((_, name)) => name,
        None => identifier,
    }
}

/// Plugin identifiers are package names: `hanna-<name>`, optionally scoped
/// as `@scope/hanna-<name>`.
pub fn is_qualified_plugin_identifier(identifier: &str) -> bool {
    let name = match identifier.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((_, name)) => name,
            None => return false,
        },
        None => identifier,
    };
    name.starts_with(PLUGIN_PREFIX) && name.len() > PLUGIN_PREFIX.len()
}

/// Plugin part of a qualified `plugin.Name` identifier.
pub fn qualifying_plugin(identifier: &str) -> Option<&str> {
    identifier.split_once('.').map(|(plugin, _)| plugin)
}

/// Host-side state of one plugin: the module plus its active dynamic platforms.
pub struct Plugin {
    module: Arc<dyn PluginModule>,
    disabled: bool,
    active_dynamic_platforms: Mutex<HashMap<String, Vec<Arc<dyn DynamicPlatform>>>>,
}

impl Plugin {
    pub fn new(module: Arc<dyn PluginModule>, disabled: bool) -> Self {
        Self {
            module,
            disabled,
            active_dynamic_platforms: Mutex::new(HashMap::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        self.module.identifier()
    }

    pub fn version(&self) -> &str {
        self.module.version()
    }

    pub fn path(&self) -> PathBuf {
        self.module.path().to_path_buf()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn provides(&self, kind: PluginKind, name: &str) -> bool {
        match kind {
            PluginKind::Platform => self.module.platform_constructor(name).is_some(),
            PluginKind::Accessory => self.module.accessory_constructor(name).is_some(),
        }
    }

    pub fn platform_constructor(&self, identifier: &str) -> Result<PlatformConstructor, PluginError> {
        let name = local_name(identifier);
        let constructor = self
            .module
            .platform_constructor(name)
            .ok_or_else(|| PluginError::NotRegistered {
                kind: PluginKind::Platform,
                name: name.to_string(),
                plugin: self.identifier().to_string(),
            })?;

        if self.active_dynamic_platforms().contains_key(name) {
            error!(
                "The dynamic platform {} from the plugin {} seems to be configured multiple times in your config.json.",
                name,
                self.identifier()
            );
        }
        Ok(constructor)
    }

    pub fn accessory_constructor(&self, identifier: &str) -> Result<AccessoryConstructor, PluginError> {
        let name = local_name(identifier);
        self.module
            .accessory_constructor(name)
            .ok_or_else(|| PluginError::NotRegistered {
                kind: PluginKind::Accessory,
                name: name.to_string(),
                plugin: self.identifier().to_string(),
            })
    }

    fn active_dynamic_platforms(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Arc<dyn DynamicPlatform>>>> {
        self.active_dynamic_platforms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a constructed dynamic platform; the latest one wins lookups.
    pub fn assign_dynamic_platform(&self, identifier: &str, platform: Arc<dyn DynamicPlatform>) {
        self.active_dynamic_platforms()
            .entry(local_name(identifier).to_string())
            .or_default()
            .insert(0, platform);
    }

    pub fn active_dynamic_platform(&self, platform: &str) -> Option<Arc<dyn DynamicPlatform>> {
        self.active_dynamic_platforms()
            .get(platform)
            .and_then(|platforms| platforms.first().cloned())
    }
}

/// Every plugin known to one process, in load order.
#[derive(Default)]
pub struct PluginManager {
    plugins: Vec<Arc<Plugin>>,
}

impl PluginManager {
    /// `active` restricts the enabled set when given; `disabled` is applied
    /// on top. Disabled plugins stay known so their config can be skipped
    /// with a warning rather than reported missing.
    pub fn new(
        modules: impl IntoIterator<Item = Arc<dyn PluginModule>>,
        active: Option<&[String]>,
        disabled: &[String],
    ) -> Self {
        let plugins = modules
            .into_iter()
            .map(|module| {
                let id = module.identifier();
                let inactive = active.is_some_and(|list| !list.iter().any(|p| p == id));
                let disabled = inactive || disabled.iter().any(|p| p == id);
                if disabled {
                    info!("Disabled plugin: {}", id);
                } else {
                    info!("Loaded plugin: {}@{}", id, module.version());
                }
                Arc::new(Plugin::new(module, disabled))
            })
            .collect();
        Self { plugins }
    }

    /// Manager holding only `identifier`, as a child bridge process uses.
    pub fn single(
        modules: impl IntoIterator<Item = Arc<dyn PluginModule>>,
        identifier: &str,
    ) -> Result<Self, PluginError> {
        let module = modules
            .into_iter()
            .find(|module| module.identifier() == identifier)
            .ok_or_else(|| PluginError::Unavailable(identifier.to_string()))?;
        Ok(Self {
            plugins: vec![Arc::new(Plugin::new(module, false))],
        })
    }

    pub fn plugins(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    pub fn get_plugin(&self, identifier: &str) -> Option<Arc<Plugin>> {
        self.plugins
            .iter()
            .find(|plugin| plugin.identifier() == identifier)
            .cloned()
    }

    pub fn get_plugin_for_platform(&self, identifier: &str) -> Result<Arc<Plugin>, PluginError> {
        self.get_plugin_for(PluginKind::Platform, identifier)
    }

    pub fn get_plugin_for_accessory(&self, identifier: &str) -> Result<Arc<Plugin>, PluginError> {
        self.get_plugin_for(PluginKind::Accessory, identifier)
    }

    fn get_plugin_for(&self, kind: PluginKind, identifier: &str) -> Result<Arc<Plugin>, PluginError> {
        let name = local_name(identifier);
        if let Some(plugin_id) = qualifying_plugin(identifier) {
            return self
                .get_plugin(plugin_id)
                .filter(|plugin| plugin.provides(kind, name))
                .ok_or_else(|| PluginError::NotFound {
                    kind,
                    name: identifier.to_string(),
                });
        }

        let candidates: Vec<_> = self
            .plugins
            .iter()
            .filter(|plugin| plugin.provides(kind, name))
            .cloned()
            .collect();
        match candidates.as_slice() {
            [] => Err(PluginError::NotFound {
                kind,
                name: identifier.to_string(),
            }),
            [plugin] => Ok(Arc::clone(plugin)),
            many => Err(PluginError::Ambiguous {
                kind,
                name: identifier.to_string(),
                candidates: many
                    .iter()
                    .map(|plugin| format!("{}.{}", plugin.identifier(), name))
                    .collect(),
            }),
        }
    }

    /// The plugin with an active dynamic platform named `platform`, if
    /// exactly one exists. Several matches are an error.
    pub fn get_plugin_by_active_dynamic_platform(
        &self,
        platform: &str,
    ) -> Result<Option<Arc<Plugin>>, PluginError> {
        let found: Vec<_> = self
            .plugins
            .iter()
            .filter(|plugin| plugin.active_dynamic_platform(platform).is_some())
            .cloned()
            .collect();
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.into_iter().next()),
            _ => {
                warn!(platform, "Several plugins registered the same dynamic platform");
                Err(PluginError::AmbiguousDynamicPlatform {
                    platform: platform.to_string(),
                    plugins: found.iter().map(|p| p.identifier().to_string()).collect(),
                })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn manager() -> PluginManager {
        PluginManager::new(
            vec![
                TestModule::new("hanna-lights").platform("Lights").into_module(),
                TestModule::new("hanna-lights-ng").platform("Lights").into_module(),
                TestModule::new("hanna-fan").accessory("Fan").into_module(),
            ],
            None,
            &[],
        )
    }

    #[test]
    fn identifier_parts() {
        assert_eq!(local_name("hanna-lights.Lights"), "Lights");
        assert_eq!(local_name("Lights"), "Lights");
        assert_eq!(qualifying_plugin("hanna-lights.Lights"), Some("hanna-lights"));
        assert_eq!(qualifying_plugin("Lights"), None);
    }

    #[test]
    fn qualified_plugin_identifiers() {
        assert!(is_qualified_plugin_identifier("hanna-lights"));
        assert!(is_qualified_plugin_identifier("@acme/hanna-lights"));
        assert!(!is_qualified_plugin_identifier("Lights"));
        assert!(!is_qualified_plugin_identifier("@acme"));
        assert!(!is_qualified_plugin_identifier("hanna-"));
    }

    #[test]
    fn unqualified_lookup_must_be_unique() {
        let manager = manager();
        assert_eq!(
            manager.get_plugin_for_accessory("Fan").unwrap().identifier(),
            "hanna-fan"
        );
        assert!(matches!(
            manager.get_plugin_for_platform("Lights"),
            Err(PluginError::Ambiguous { .. })
        ));
        assert_eq!(
            manager
                .get_plugin_for_platform("hanna-lights-ng.Lights")
                .unwrap()
                .identifier(),
            "hanna-lights-ng"
        );
        assert!(matches!(
            manager.get_plugin_for_platform("Heaters"),
            Err(PluginError::NotFound { .. })
        ));
    }

    #[test]
    fn active_dynamic_platform_lookup() {
        let manager = manager();
        assert!(manager
            .get_plugin_by_active_dynamic_platform("Lights")
            .unwrap()
            .is_none());

        let lights = manager.get_plugin("hanna-lights").unwrap();
        lights.assign_dynamic_platform("hanna-lights.Lights", Arc::new(RecordingPlatform::default()));
        let found = manager.get_plugin_by_active_dynamic_platform("Lights").unwrap();
        assert_eq!(found.map(|p| p.identifier().to_string()).as_deref(), Some("hanna-lights"));

        let ng = manager.get_plugin("hanna-lights-ng").unwrap();
        ng.assign_dynamic_platform("Lights", Arc::new(RecordingPlatform::default()));
        assert!(manager.get_plugin_by_active_dynamic_platform("Lights").is_err());
    }

    #[test]
    fn inactive_and_disabled_plugins_are_marked() {
        let active = vec!["hanna-fan".to_string(), "hanna-lights".to_string()];
        let disabled = vec!["hanna-lights".to_string()];
        let manager = PluginManager::new(
            vec![
                TestModule::new("hanna-lights").into_module(),
                TestModule::new("hanna-lights-ng").into_module(),
                TestModule::new("hanna-fan").into_module(),
            ],
            Some(active.as_slice()),
            &disabled,
        );
        let states: Vec<_> = manager.plugins().iter().map(|p| p.is_disabled()).collect();
        assert_eq!(states, vec![true, true, false]);
    }

    #[test]
    fn single_plugin_manager() {
        let modules = vec![
            TestModule::new("a").into_module(),
            TestModule::new("b").into_module(),
        ];
        let manager = PluginManager::single(modules.clone(), "b").unwrap();
        assert_eq!(manager.plugins().len(), 1);
        assert!(matches!(
            PluginManager::single(modules, "c"),
            Err(PluginError::Unavailable(_))
        ));
    }
}
