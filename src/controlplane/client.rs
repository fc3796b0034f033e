//! Control-plane client
//!
//! Used by `proxy-e2e push` to publish into a running control plane and by
//! the mock proxy to subscribe to one.

use std::net::SocketAddr;

use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::common::{Error, Result};

use super::protocol::{ClientMessage, Resource, ServerMessage, Snapshot};
use super::transport;

/// Connection to a control plane
pub struct ControlPlaneClient {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlPlaneClient {
    /// Connect to the control plane at `addr`
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::ControlPlane(format!("failed to connect to {}: {}", addr, e))
        })?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            addr,
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Publish a snapshot for `node` and wait for the verdict
    pub async fn push(&mut self, node: &str, version: &str, resources: Vec<Resource>) -> Result<()> {
        let request = ClientMessage::Push {
            node: node.to_string(),
            version: version.to_string(),
            resources,
        };
        transport::send_json(&mut self.writer, &request).await?;

        match transport::recv_json(&mut self.reader).await? {
            Some(ServerMessage::Pushed { .. }) => Ok(()),
            Some(ServerMessage::Error { message }) => Err(Error::Rejected {
                node: node.to_string(),
                version: version.to_string(),
                reason: message,
            }),
            Some(other) => Err(Error::ControlPlane(format!(
                "unexpected reply to push: {:?}",
                other
            ))),
            None => Err(Error::ControlPlane(format!(
                "{} closed the connection during push",
                self.addr
            ))),
        }
    }

    /// Turn this connection into a snapshot stream for `node`
    pub async fn subscribe(mut self, node: &str) -> Result<Subscription> {
        let request = ClientMessage::Subscribe {
            node: node.to_string(),
        };
        transport::send_json(&mut self.writer, &request).await?;

        Ok(Subscription {
            node: node.to_string(),
            reader: self.reader,
            writer: self.writer,
        })
    }
}

/// A subscribed connection; yields snapshots and sends acknowledgements
pub struct Subscription {
    node: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Subscription {
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Next snapshot, or `None` once the control plane hangs up
    pub async fn next_snapshot(&mut self) -> Result<Option<Snapshot>> {
        loop {
            match transport::recv_json(&mut self.reader).await? {
                Some(ServerMessage::Snapshot(snapshot)) => return Ok(Some(snapshot)),
                Some(ServerMessage::Error { message }) => {
                    tracing::warn!(node = %self.node, "Control plane error: {}", message);
                }
                Some(other) => {
                    tracing::debug!(node = %self.node, message = ?other, "Ignoring message");
                }
                None => return Ok(None),
            }
        }
    }

    pub async fn ack(&mut self, version: &str) -> Result<()> {
        let message = ClientMessage::Ack {
            version: version.to_string(),
        };
        transport::send_json(&mut self.writer, &message).await
    }

    pub async fn nack(&mut self, version: &str, error: &str) -> Result<()> {
        let message = ClientMessage::Nack {
            version: version.to_string(),
            error: error.to_string(),
        };
        transport::send_json(&mut self.writer, &message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::ControlPlane;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ControlPlaneClient::connect(addr).await.err().unwrap();
        assert!(matches!(err, Error::ControlPlane(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_nack_is_recorded() {
        let mut server = ControlPlane::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let handle = server.handle();
        handle.update("server", "1", vec![Resource::listener("oops")]).unwrap();

        let mut sub = ControlPlaneClient::connect(server.local_addr())
            .await
            .unwrap()
            .subscribe("server")
            .await
            .unwrap();
        assert_eq!(sub.node(), "server");

        let snapshot = sub.next_snapshot().await.unwrap().unwrap();
        sub.nack(&snapshot.version, "cannot parse listener").await.unwrap();

        let err = handle
            .wait_for_ack("server", "1", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::Rejected { reason, .. } => assert_eq!(reason, "cannot parse listener"),
            other => panic!("expected Rejected, got {:?}", other),
        }

        server.shutdown().await.unwrap();
    }
}
