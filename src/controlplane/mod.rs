//! Control-plane mock
//!
//! Serves per-node configuration snapshots to proxies over a local TCP
//! socket and accepts new snapshots from update steps and the `push`
//! command.

mod cache;
mod client;
mod protocol;
mod server;
mod transport;

pub use cache::{AckEvent, SnapshotCache, UpdateOutcome};
pub use client::{ControlPlaneClient, Subscription};
pub use protocol::{compare_versions, ClientMessage, Resource, ResourceType, ServerMessage, Snapshot};
pub use server::{ControlPlane, ControlPlaneHandle};
