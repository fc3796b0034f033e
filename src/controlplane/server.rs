//! Control-plane server - TCP listener and per-connection loops

use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use crate::common::{Error, Result};

use super::cache::{AckEvent, SnapshotCache, UpdateOutcome};
use super::protocol::{compare_versions, ClientMessage, Resource, ServerMessage, Snapshot};
use super::transport;

/// Cloneable access to a running control plane's snapshots
#[derive(Clone)]
pub struct ControlPlaneHandle {
    addr: SocketAddr,
    cache: Arc<SnapshotCache>,
}

impl ControlPlaneHandle {
    /// Address the control plane listens on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Publish a snapshot for `node`; see [`SnapshotCache::update`]
    pub fn update(&self, node: &str, version: &str, resources: Vec<Resource>) -> Result<UpdateOutcome> {
        self.cache.update(node, version, resources)
    }

    /// Snapshot currently served to `node`
    pub fn snapshot(&self, node: &str) -> Option<Arc<Snapshot>> {
        self.cache.snapshot(node)
    }

    /// Number of proxies currently subscribed as `node`
    pub fn subscribers(&self, node: &str) -> usize {
        self.cache.subscribers(node)
    }

    /// Wait for `node` to acknowledge `version`
    pub async fn wait_for_ack(&self, node: &str, version: &str, timeout: Duration) -> Result<()> {
        self.cache.wait_for_ack(node, version, timeout).await
    }
}

/// A running control-plane mock
///
/// The accept loop and every connection task run in the background until
/// [`ControlPlane::shutdown`] stops and joins them. Dropping the value
/// without calling `shutdown` aborts the loop.
pub struct ControlPlane {
    handle: ControlPlaneHandle,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControlPlane {
    /// Bind `addr` and start serving
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::ControlPlaneBind {
                addr: addr.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;
        let cache = Arc::new(SnapshotCache::new());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, cache.clone(), shutdown_rx));

        tracing::info!(%addr, "Control plane listening");

        Ok(Self {
            handle: ControlPlaneHandle { addr, cache },
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn handle(&self) -> ControlPlaneHandle {
        self.handle.clone()
    }

    /// Stop accepting, close every connection and release the port
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Internal(format!("control plane task failed: {}", e)))?;
            tracing::info!(addr = %self.handle.addr, "Control plane stopped");
        }
        Ok(())
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    cache: Arc<SnapshotCache>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Control plane connection accepted");
                    let cache = cache.clone();
                    connections.spawn(async move {
                        if let Err(e) = serve_connection(stream, cache).await {
                            tracing::warn!(%peer, error = %e, "Control plane connection failed");
                        }
                        tracing::debug!(%peer, "Control plane connection closed");
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        tracing::error!("Control plane connection panicked: {}", e);
                    }
                }
            }
        }
    }

    connections.shutdown().await;
}

/// Handle one client until it disconnects
///
/// A connection may push any number of snapshots. Once it subscribes it
/// becomes a stream of snapshots for that node and only ACK/NACK are read.
async fn serve_connection(stream: TcpStream, cache: Arc<SnapshotCache>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let message: ClientMessage = match transport::recv_json(&mut reader).await? {
            Some(message) => message,
            None => return Ok(()),
        };

        match message {
            ClientMessage::Push {
                node,
                version,
                resources,
            } => {
                let reply = match cache.update(&node, &version, resources) {
                    Ok(_) => ServerMessage::Pushed { node, version },
                    Err(e) => ServerMessage::Error {
                        message: e.to_string(),
                    },
                };
                transport::send_json(&mut writer, &reply).await?;
            }
            ClientMessage::Subscribe { node } => {
                return serve_subscriber(node, reader, writer, &cache).await;
            }
            ClientMessage::Ack { .. } | ClientMessage::Nack { .. } => {
                let reply = ServerMessage::Error {
                    message: "subscribe before acknowledging".to_string(),
                };
                transport::send_json(&mut writer, &reply).await?;
            }
        }
    }
}

async fn serve_subscriber(
    node: String,
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    cache: &SnapshotCache,
) -> Result<()> {
    let mut updates = cache.subscribe(&node);
    tracing::info!(node = %node, "Proxy subscribed");

    let acks = read_acks(reader, &node, cache);
    tokio::pin!(acks);

    let mut last_sent: Option<String> = None;
    loop {
        let current = updates.borrow_and_update().clone();
        if let Some(snapshot) = current {
            let newer = last_sent
                .as_deref()
                .map_or(true, |sent| compare_versions(&snapshot.version, sent) == Ordering::Greater);
            if newer {
                tracing::debug!(node = %node, version = %snapshot.version, "Sending snapshot");
                transport::send_json(&mut writer, &ServerMessage::Snapshot((*snapshot).clone()))
                    .await?;
                last_sent = Some(snapshot.version.clone());
            }
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            finished = &mut acks => {
                tracing::info!(node = %node, "Proxy unsubscribed");
                return finished;
            }
        }
    }
}

async fn read_acks(mut reader: BufReader<OwnedReadHalf>, node: &str, cache: &SnapshotCache) -> Result<()> {
    loop {
        let message: ClientMessage = match transport::recv_json(&mut reader).await? {
            Some(message) => message,
            None => return Ok(()),
        };

        match message {
            ClientMessage::Ack { version } => cache.record_ack(node, AckEvent::Ack { version }),
            ClientMessage::Nack { version, error } => {
                cache.record_ack(node, AckEvent::Nack { version, error })
            }
            other => {
                tracing::warn!(node, message = ?other, "Ignoring request on a subscribed connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::client::ControlPlaneClient;

    async fn start() -> ControlPlane {
        ControlPlane::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn test_subscriber_gets_current_then_updates() {
        let mut server = start().await;
        let handle = server.handle();
        handle
            .update("server", "0", vec![Resource::listener("first")])
            .unwrap();

        let mut sub = ControlPlaneClient::connect(server.local_addr())
            .await
            .unwrap()
            .subscribe("server")
            .await
            .unwrap();

        let first = sub.next_snapshot().await.unwrap().unwrap();
        assert_eq!(first.version, "0");
        sub.ack(&first.version).await.unwrap();
        handle
            .wait_for_ack("server", "0", Duration::from_secs(5))
            .await
            .unwrap();

        handle
            .update("server", "1", vec![Resource::listener("second")])
            .unwrap();
        let second = sub.next_snapshot().await.unwrap().unwrap();
        assert_eq!(second.version, "1");
        assert_eq!(second.resources, vec![Resource::listener("second")]);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resumes_from_current_snapshot() {
        let mut server = start().await;
        let handle = server.handle();
        handle.update("server", "0", vec![Resource::listener("a")]).unwrap();

        let sub = ControlPlaneClient::connect(server.local_addr())
            .await
            .unwrap()
            .subscribe("server")
            .await
            .unwrap();
        drop(sub);

        handle.update("server", "1", vec![Resource::listener("b")]).unwrap();
        handle.update("server", "2", vec![Resource::listener("c")]).unwrap();

        let mut sub = ControlPlaneClient::connect(server.local_addr())
            .await
            .unwrap()
            .subscribe("server")
            .await
            .unwrap();
        let snapshot = sub.next_snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.version, "2");

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_push_over_the_wire() {
        let mut server = start().await;
        let mut client = ControlPlaneClient::connect(server.local_addr()).await.unwrap();

        client
            .push("client", "4", vec![Resource::cluster("backend")])
            .await
            .unwrap();
        assert_eq!(server.handle().snapshot("client").unwrap().version, "4");

        let err = client
            .push("client", "3", vec![Resource::cluster("backend")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }), "{:?}", err);

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_port() {
        let mut server = start().await;
        let addr = server.local_addr();
        let _sub = ControlPlaneClient::connect(addr)
            .await
            .unwrap()
            .subscribe("server")
            .await
            .unwrap();

        server.shutdown().await.unwrap();
        server.shutdown().await.unwrap();

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok(), "port still held after shutdown");
    }

    #[tokio::test]
    async fn test_no_subscriber_is_not_an_error() {
        let mut server = start().await;
        let handle = server.handle();

        handle.update("nobody", "0", vec![]).unwrap();
        assert_eq!(handle.subscribers("nobody"), 0);

        server.shutdown().await.unwrap();
    }
}
