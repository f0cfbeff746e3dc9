//! Accessory records handled by a bridge.
//!
//! The protocol runtime owns services and characteristics; here they are an
//! opaque JSON state blob carried alongside the fields the host interprets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Category the protocol runtime advertises for a bridge.
pub const CATEGORY_BRIDGE: u16 = 2;

/// Stable accessory id derived from `data`, in 8-4-4-4-12 hex form.
pub fn generate_uuid(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Accessory as attached to a bridge or published on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessory {
    pub uuid: String,
    pub display_name: String,
    pub category: Option<u16>,
}

impl Accessory {
    pub fn new(display_name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            display_name: display_name.into(),
            category: None,
        }
    }
}

/// Accessory created by a platform plugin at runtime. Its serialized form is
/// what the accessory cache persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformAccessory {
    #[serde(rename = "UUID")]
    pub uuid: String,
    pub display_name: String,
    /// Identifier of the owning plugin.
    #[serde(default)]
    pub plugin: String,
    /// Platform name the accessory was registered under.
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<u16>,
    /// Free-form data the plugin stores with the accessory.
    #[serde(default)]
    pub context: Value,
    /// Protocol runtime state (services, characteristics, controllers).
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl PlatformAccessory {
    pub fn new(display_name: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            display_name: display_name.into(),
            plugin: String::new(),
            platform: String::new(),
            category: None,
            context: Value::Object(Map::new()),
            state: Map::new(),
        }
    }

    pub fn with_category(mut self, category: u16) -> Self {
        self.category = Some(category);
        self
    }

    pub fn accessory(&self) -> Accessory {
        Accessory {
            uuid: self.uuid.clone(),
            display_name: self.display_name.clone(),
            category: self.category,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uuid_is_stable_and_formatted() {
        let a = generate_uuid("Fan:Kitchen");
        assert_eq!(a, generate_uuid("Fan:Kitchen"));
        assert_ne!(a, generate_uuid("Fan:Hall"));
        let groups: Vec<_> = a.split('-').map(str::len).collect();
        assert_eq!(groups, vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn cached_form_keeps_protocol_state() {
        let record = json!({
            "UUID": "abc",
            "displayName": "Lamp",
            "plugin": "hanna-lights",
            "platform": "Lights",
            "context": {"room": "hall"},
            "services": [{"type": "3E"}]
        });
        let accessory: PlatformAccessory = serde_json::from_value(record.clone()).unwrap();
        assert_eq!(accessory.plugin, "hanna-lights");
        assert_eq!(accessory.state.get("services"), Some(&json!([{"type": "3E"}])));
        assert_eq!(serde_json::to_value(&accessory).unwrap(), record);
    }
}
