//! Control-plane wire messages
//!
//! Every frame carries one JSON object tagged by `type`. A proxy opens a
//! connection, sends `subscribe`, and from then on receives a `snapshot`
//! whenever its node's configuration changes, answering each with `ack` or
//! `nack`. Tools that only publish configuration send `push` instead and
//! get `pushed` or `error` back.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Kind of configuration resource carried in a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Listener,
    Cluster,
}

/// One rendered resource definition; the body is opaque to the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "type")]
    pub kind: ResourceType,
    pub body: String,
}

impl Resource {
    pub fn listener(body: impl Into<String>) -> Self {
        Self {
            kind: ResourceType::Listener,
            body: body.into(),
        }
    }

    pub fn cluster(body: impl Into<String>) -> Self {
        Self {
            kind: ResourceType::Cluster,
            body: body.into(),
        }
    }
}

/// Full configuration served to one node at one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node: String,
    pub version: String,
    pub resources: Vec<Resource>,
}

impl Snapshot {
    /// Resources of one type, in push order
    pub fn of_type(&self, kind: ResourceType) -> impl Iterator<Item = &Resource> + '_ {
        self.resources.iter().filter(move |r| r.kind == kind)
    }
}

/// Messages sent by proxies and publishing tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identify as `node` and start receiving snapshots
    Subscribe { node: String },

    /// The snapshot at `version` was applied
    Ack { version: String },

    /// The snapshot at `version` was refused
    Nack { version: String, error: String },

    /// Publish a new snapshot for `node`
    Push {
        node: String,
        version: String,
        resources: Vec<Resource>,
    },
}

/// Messages sent by the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current configuration for the subscribed node
    Snapshot(Snapshot),

    /// A push was applied (or was an identical re-push)
    Pushed { node: String, version: String },

    /// The last request was refused
    Error { message: String },
}

/// Order two version strings
///
/// Versions that both parse as integers compare numerically so that "10"
/// follows "9"; anything else compares as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_versions_compare_numerically() {
        assert_eq!(compare_versions("9", "10"), Ordering::Less);
        assert_eq!(compare_versions("10", "10"), Ordering::Equal);
        assert_eq!(compare_versions("v2", "v10"), Ordering::Greater);
    }

    #[test]
    fn test_message_tags() {
        let json = serde_json::to_value(ClientMessage::Subscribe {
            node: "server".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "subscribe", "node": "server"}));

        let snapshot = ServerMessage::Snapshot(Snapshot {
            node: "server".to_string(),
            version: "0".to_string(),
            resources: vec![Resource::listener("name: server")],
        });
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["resources"][0]["type"], "listener");

        let back: ServerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_of_type_keeps_order() {
        let snapshot = Snapshot {
            node: "client".to_string(),
            version: "3".to_string(),
            resources: vec![
                Resource::listener("a"),
                Resource::cluster("x"),
                Resource::listener("b"),
            ],
        };

        let listeners: Vec<&str> = snapshot
            .of_type(ResourceType::Listener)
            .map(|r| r.body.as_str())
            .collect();
        assert_eq!(listeners, vec!["a", "b"]);
    }
}
