use crate::config::PluginKind;
use crate::control::ControlEvent;
use crate::identity::BridgeIdentity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Child bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildStatus {
    /// Process is being spawned
    Spawning,
    /// Process is running, handshake not complete
    Pending,
    /// Bridge is online
    Ok,
    /// Process exited or failed to start
    Down,
}

impl ChildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildStatus::Spawning => "spawning",
            ChildStatus::Pending => "pending",
            ChildStatus::Ok => "ok",
            ChildStatus::Down => "down",
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ChildStatus::Ok)
    }
}

impl fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one child bridge, as reported over the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildMetadata {
    pub status: ChildStatus,
    pub username: BridgeIdentity,
    pub name: String,
    pub plugin: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub identifier: String,
    pub pid: Option<u32>,
}

/// New status plus the event announcing it.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub metadata: ChildMetadata,
    pub event: ControlEvent,
}

impl ChildMetadata {
    /// Move to `status`. Every transition is announced, including one to the
    /// current status.
    pub fn transition(mut self, status: ChildStatus) -> StatusTransition {
        self.status = status;
        let event = ControlEvent::ChildBridgeStatusUpdate(self.clone());
        StatusTransition {
            metadata: self,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ChildMetadata {
        ChildMetadata {
            status: ChildStatus::Pending,
            username: BridgeIdentity::parse("0E:00:00:00:00:01").unwrap(),
            name: "Lights".into(),
            plugin: "hanna-lights".into(),
            kind: PluginKind::Platform,
            identifier: "Lights".into(),
            pid: Some(42),
        }
    }

    #[test]
    fn transition_returns_event_with_new_status() {
        let transition = metadata().transition(ChildStatus::Ok);
        assert_eq!(transition.metadata.status, ChildStatus::Ok);
        match transition.event {
            ControlEvent::ChildBridgeStatusUpdate(update) => {
                assert_eq!(update, transition.metadata)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn same_status_is_still_announced() {
        let transition = metadata().transition(ChildStatus::Pending);
        assert!(matches!(
            transition.event,
            ControlEvent::ChildBridgeStatusUpdate(_)
        ));
    }

    #[test]
    fn wire_form() {
        let value = serde_json::to_value(metadata()).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["username"], "0E:00:00:00:00:01");
        assert_eq!(value["type"], "platform");
    }
}
