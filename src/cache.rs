//! Persisted platform accessories of one bridge.
//!
//! Each bridge owns one cache item (see [`BridgeOptions`]). The item is read
//! once at startup, reconciled against the loaded plugins and rewritten after
//! every change. A successful non-empty read is copied to a hidden backup
//! item, which is used when the primary no longer parses.

use crate::accessory::PlatformAccessory;
use crate::bridge::Bridge;
use crate::config::BridgeOptions;
use crate::plugin::PluginManager;
use crate::storage::StorageService;
use tracing::{debug, error, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Handed back to their dynamic platform and attached.
    pub restored: usize,
    /// Kept without an owner because orphans are retained.
    pub orphaned: usize,
    /// Dropped: no owner, or the bridge refused them.
    pub evicted: usize,
    /// Re-associated with a plugin under a new identifier.
    pub renamed: usize,
}

pub struct AccessoryCache {
    storage: StorageService,
    item_name: String,
    accessories: Vec<PlatformAccessory>,
    loaded: bool,
}

impl AccessoryCache {
    pub fn new(storage: StorageService, item_name: impl Into<String>) -> Self {
        Self {
            storage,
            item_name: item_name.into(),
            accessories: Vec::new(),
            loaded: false,
        }
    }

    pub fn for_bridge(options: &BridgeOptions) -> Self {
        Self::new(
            StorageService::new(&options.cached_accessories_dir),
            options.cached_accessories_item_name.clone(),
        )
    }

    pub fn item_name(&self) -> &str {
        &self.item_name
    }

    pub fn backup_item_name(&self) -> String {
        format!(".{}.bak", self.item_name)
    }

    pub fn accessories(&self) -> &[PlatformAccessory] {
        &self.accessories
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Read the cache item, falling back to the backup when the primary is
    /// corrupted. Returns the number of accessories loaded.
    pub async fn load(&mut self) -> usize {
        if let Err(e) = self.storage.init().await {
            warn!("Failed to create the cached accessories directory: {}", e);
        }

        let (records, from_primary) = match self
            .storage
            .get_item::<Vec<PlatformAccessory>>(&self.item_name)
            .await
        {
            Ok(records) => (records, true),
            Err(e) if e.is_corruption() => {
                error!("Failed to load cached accessories from disk: {}", e);
                (self.restore_backup().await, false)
            }
            Err(e) => {
                error!(
                    "Failed to load cached accessories from disk: {}. Not restoring cached accessories - some accessories may be reset.",
                    e
                );
                (None, false)
            }
        };

        if let Some(records) = records {
            info!(
                "Loaded {} cached accessories from {}.",
                records.len(),
                self.item_name
            );
            if from_primary && !records.is_empty() {
                self.create_backup().await;
            }
            self.accessories = records;
        }

        self.loaded = true;
        self.accessories.len()
    }

    async fn create_backup(&self) {
        let backup = self.backup_item_name();
        if let Err(e) = self.storage.copy_item(&self.item_name, &backup).await {
            warn!(
                "Failed to create a backup of the {} cached accessories file: {}",
                self.item_name, e
            );
        }
    }

    async fn restore_backup(&self) -> Option<Vec<PlatformAccessory>> {
        let backup = self.backup_item_name();
        match self.storage.get_item::<Vec<PlatformAccessory>>(&backup).await {
            Ok(Some(records)) => {
                warn!(
                    "Recovered {} accessories from {} cache backup.",
                    records.len(),
                    self.item_name
                );
                Some(records)
            }
            Ok(None) => {
                error!(
                    "No backup of {} exists; all cached accessories are lost.",
                    self.item_name
                );
                None
            }
            Err(e) => {
                error!(
                    "The {} cache backup is unusable ({}); all cached accessories are lost.",
                    self.item_name, e
                );
                None
            }
        }
    }

    /// Rewrite the cache item. Skipped until a load was attempted, so an
    /// early shutdown cannot wipe the file.
    pub async fn save(&self) {
        if !self.loaded {
            debug!(item = %self.item_name, "Cache not loaded yet; skipping save");
            return;
        }
        if let Err(e) = self.storage.set_item(&self.item_name, &self.accessories).await {
            error!(
                "Failed to save cached accessories to disk: {}. Your accessories will not persist between restarts until this issue is resolved.",
                e
            );
        }
    }

    pub fn register(&mut self, accessory: PlatformAccessory) {
        self.accessories.push(accessory);
    }

    /// Replace the stored copy of `accessory`; returns whether it was known.
    pub fn update(&mut self, accessory: PlatformAccessory) -> bool {
        match self.accessories.iter_mut().find(|a| a.uuid == accessory.uuid) {
            Some(existing) => {
                *existing = accessory;
                true
            }
            None => false,
        }
    }

    pub fn unregister(&mut self, uuid: &str) -> Option<PlatformAccessory> {
        let index = self.accessories.iter().position(|a| a.uuid == uuid)?;
        Some(self.accessories.remove(index))
    }

    /// Re-attach every cached accessory to its owning plugin and to `bridge`.
    ///
    /// An owner missing under the recorded identifier is searched for by
    /// active dynamic platform, which follows plugin renames. Accessories
    /// still without an owner are dropped unless `keep_orphans` is set. An
    /// accessory the bridge refuses is dropped with a warning.
    pub fn reconcile(
        &mut self,
        plugins: &PluginManager,
        bridge: &mut Bridge,
        keep_orphans: bool,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let records = std::mem::take(&mut self.accessories);

        for mut accessory in records {
            let mut plugin = plugins.get_plugin(&accessory.plugin);
            if plugin.is_none() {
                match plugins.get_plugin_by_active_dynamic_platform(&accessory.platform) {
                    Ok(Some(found)) => {
                        info!(
                            "When searching for the associated plugin of the accessory '{}' it seems like the plugin name changed from '{}' to '{}'. Plugin association is now being transformed!",
                            accessory.display_name,
                            accessory.plugin,
                            found.identifier()
                        );
                        accessory.plugin = found.identifier().to_string();
                        report.renamed += 1;
                        plugin = Some(found);
                    }
                    Ok(None) => {}
                    Err(e) => info!(
                        "Could not find the associated plugin for the accessory '{}'. Tried to find the plugin by the platform name but {}",
                        accessory.display_name, e
                    ),
                }
            }

            let platform = plugin
                .as_ref()
                .and_then(|plugin| plugin.active_dynamic_platform(&accessory.platform));
            let managed = match platform {
                Some(platform) => {
                    platform.configure_accessory(&accessory);
                    true
                }
                None if keep_orphans => {
                    info!(
                        "Failed to find plugin to handle accessory {}; keeping it as an orphan",
                        accessory.display_name
                    );
                    false
                }
                None => {
                    info!(
                        "Removing orphaned accessory {} as no plugin handles it",
                        accessory.display_name
                    );
                    report.evicted += 1;
                    continue;
                }
            };

            if let Err(e) = bridge.add_bridged_accessory(accessory.accessory()) {
                warn!(
                    "[{}] Could not restore cached accessory '{}': {}",
                    accessory.plugin, accessory.display_name, e
                );
                report.evicted += 1;
                continue;
            }

            if managed {
                report.restored += 1;
            } else {
                report.orphaned += 1;
            }
            self.accessories.push(accessory);
        }

        debug!(?report, item = %self.item_name, "Reconciled cached accessories");
        report
    }
}
