//! Per-node snapshot store
//!
//! Each node owns a watch channel holding its latest snapshot. Publishing
//! goes through `send_if_modified`, which runs under the channel's write
//! lock, so updates to one node apply one at a time in call order while
//! different nodes never contend. Subscribers read the current value first
//! and then follow changes, which gives late joiners the current state and
//! never shows a version older than one already seen.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::common::{Error, Result};

use super::protocol::{compare_versions, Resource, Snapshot};

/// What an update did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The snapshot replaced the served one
    Applied,
    /// Same version and resources as already served; nothing changed
    Unchanged,
}

/// Latest acknowledgement reported by a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Ack { version: String },
    Nack { version: String, error: String },
}

struct NodeState {
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    ack: watch::Sender<Option<AckEvent>>,
}

impl NodeState {
    fn new() -> Self {
        let (snapshot, _) = watch::channel(None);
        let (ack, _) = watch::channel(None);
        Self { snapshot, ack }
    }
}

/// Snapshot store shared by the server, its connections and update steps
#[derive(Default)]
pub struct SnapshotCache {
    nodes: Mutex<HashMap<String, Arc<NodeState>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, node: &str) -> Arc<NodeState> {
        let mut nodes = match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        nodes
            .entry(node.to_string())
            .or_insert_with(|| Arc::new(NodeState::new()))
            .clone()
    }

    /// Publish `resources` at `version` for `node`
    ///
    /// The version must be greater than the one currently served. Re-pushing
    /// the served version with identical resources is accepted as a no-op;
    /// anything else at an equal or lower version is refused.
    pub fn update(&self, node: &str, version: &str, resources: Vec<Resource>) -> Result<UpdateOutcome> {
        let state = self.node(node);
        let mut outcome = Err(Error::Internal("update not applied".to_string()));

        state.snapshot.send_if_modified(|current| {
            let accept = match current.as_deref() {
                None => true,
                Some(served) => match compare_versions(version, &served.version) {
                    Ordering::Greater => true,
                    Ordering::Equal if served.resources == resources => {
                        outcome = Ok(UpdateOutcome::Unchanged);
                        return false;
                    }
                    _ => {
                        outcome = Err(Error::StaleVersion {
                            node: node.to_string(),
                            current: served.version.clone(),
                            attempted: version.to_string(),
                        });
                        return false;
                    }
                },
            };

            if accept {
                *current = Some(Arc::new(Snapshot {
                    node: node.to_string(),
                    version: version.to_string(),
                    resources,
                }));
                outcome = Ok(UpdateOutcome::Applied);
            }
            accept
        });

        if let Ok(applied) = &outcome {
            tracing::info!(node, version, outcome = ?applied, "Snapshot published");
        }
        outcome
    }

    /// Snapshot currently served to `node`
    pub fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.node(node).snapshot.borrow().clone()
    }

    /// Follow `node`'s snapshots, starting from the current one
    pub fn subscribe(&self, node: &str) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.node(node).snapshot.subscribe()
    }

    /// Number of live subscriptions for `node`
    pub fn subscribers(&self, node: &str) -> usize {
        self.node(node).snapshot.receiver_count()
    }

    /// Record an ACK or NACK reported by `node`
    pub fn record_ack(&self, node: &str, event: AckEvent) {
        match &event {
            AckEvent::Ack { version } => tracing::debug!(node, %version, "Snapshot acknowledged"),
            AckEvent::Nack { version, error } => {
                tracing::warn!(node, %version, %error, "Snapshot rejected by proxy")
            }
        }
        self.node(node).ack.send_replace(Some(event));
    }

    /// Latest acknowledgement from `node`
    pub fn last_ack(&self, node: &str) -> Option<AckEvent> {
        self.node(node).ack.borrow().clone()
    }

    /// Wait until `node` acknowledges `version` (or anything newer)
    ///
    /// Fails with `Rejected` if the node NACKs exactly that version and with
    /// `AckTimeout` if nothing conclusive arrives within `timeout`.
    pub async fn wait_for_ack(&self, node: &str, version: &str, timeout: Duration) -> Result<()> {
        let state = self.node(node);
        let mut acks = state.ack.subscribe();

        let conclusive = |event: &Option<AckEvent>| match event {
            Some(AckEvent::Ack { version: acked }) => {
                compare_versions(acked, version) != Ordering::Less
            }
            Some(AckEvent::Nack { version: refused, .. }) => refused == version,
            None => false,
        };

        let waited = tokio::time::timeout(timeout, acks.wait_for(conclusive)).await;
        match waited {
            Ok(Ok(event)) => match (*event).clone() {
                Some(AckEvent::Nack { version, error }) => Err(Error::Rejected {
                    node: node.to_string(),
                    version,
                    reason: error,
                }),
                _ => Ok(()),
            },
            Ok(Err(_)) => Err(Error::Internal(format!(
                "acknowledgement channel for node '{}' closed",
                node
            ))),
            Err(_) => Err(Error::AckTimeout {
                node: node.to_string(),
                version: version.to_string(),
                timeout_ms: timeout.as_millis() as u64,
                last: match self.last_ack(node) {
                    Some(AckEvent::Ack { version }) => format!("ack {}", version),
                    Some(AckEvent::Nack { version, .. }) => format!("nack {}", version),
                    None => "none".to_string(),
                },
            }),
        }
    }
}
