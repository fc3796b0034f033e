//! Control-plane steps

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::controlplane::{ControlPlane, Resource};
use crate::params::Params;
use crate::scenario::Lifecycle;

/// Start the control-plane mock on `XDSPort`
///
/// Later steps reach it through [`Params::control_plane`]. Closing stops the
/// accept loop, drops every proxy connection and frees the port.
#[derive(Default)]
pub struct Xds {
    server: Option<ControlPlane>,
}

impl Xds {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Lifecycle for Xds {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        if self.server.is_some() {
            return Err(Error::Config("control plane step already running".to_string()));
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, params.ports().xds_port));
        let server = ControlPlane::bind(addr).await?;
        params.set_control_plane(server.handle());
        self.server = Some(server);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            server.shutdown().await?;
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "xds"
    }
}

/// Whether an [`Update`] waits for the node to acknowledge its version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckWait {
    /// Publish and move on
    #[default]
    Skip,
    /// Wait up to `timeouts.ack_secs` from the configuration
    Configured,
    /// Wait up to this long
    Within(Duration),
}

/// Push a new snapshot for one node
///
/// Listener and cluster bodies are templates rendered against the scenario
/// parameters; so are the node and version. Unless `ack` is
/// [`AckWait::Skip`], the step also waits for the node to acknowledge the
/// pushed version.
#[derive(Debug, Clone)]
pub struct Update {
    pub node: String,
    pub version: String,
    pub listeners: Vec<String>,
    pub clusters: Vec<String>,
    pub ack: AckWait,
}

impl Update {
    pub fn new(node: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            version: version.into(),
            listeners: Vec::new(),
            clusters: Vec::new(),
            ack: AckWait::Skip,
        }
    }

    pub fn listener(mut self, template: impl Into<String>) -> Self {
        self.listeners.push(template.into());
        self
    }

    pub fn cluster(mut self, template: impl Into<String>) -> Self {
        self.clusters.push(template.into());
        self
    }

    /// Wait for the ACK within the configured ack timeout
    pub fn await_ack(mut self) -> Self {
        self.ack = AckWait::Configured;
        self
    }

    pub fn wait_for_ack(mut self, timeout: Duration) -> Self {
        self.ack = AckWait::Within(timeout);
        self
    }

    fn render(&self, params: &Params) -> Result<Vec<Resource>> {
        let listeners = self
            .listeners
            .iter()
            .map(|t| params.render(t).map(Resource::listener));
        let clusters = self
            .clusters
            .iter()
            .map(|t| params.render(t).map(Resource::cluster));
        listeners.chain(clusters).collect()
    }
}

#[async_trait]
impl Lifecycle for Update {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        let node = params.render(&self.node)?;
        let version = params.render(&self.version)?;
        let resources = self.render(params)?;
        let control_plane = params.control_plane()?.clone();

        let outcome = control_plane.update(&node, &version, resources)?;
        tracing::debug!(node = %node, version = %version, ?outcome, "Update pushed");

        let timeout = match self.ack {
            AckWait::Skip => None,
            AckWait::Configured => Some(params.config().timeouts.ack()),
            AckWait::Within(timeout) => Some(timeout),
        };
        if let Some(timeout) = timeout {
            control_plane
                .wait_for_ack(&node, &version, params.clamp(timeout))
                .await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "update"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::Config;
    use std::collections::BTreeMap;

    fn params() -> Params {
        let vars = BTreeMap::from([("Cluster".to_string(), "backend".to_string())]);
        Params::new("xds_test", vars, Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_update_requires_control_plane() {
        let mut p = params();
        let err = Update::new("server", "0").run(&mut p).await.unwrap_err();
        assert!(matches!(err, Error::ControlPlaneNotRunning));
    }

    #[tokio::test]
    async fn test_update_renders_and_publishes() {
        let mut p = params();
        let mut xds = Xds::new();
        xds.run(&mut p).await.unwrap();

        Update::new("server", "0")
            .listener("port: {{ .Ports.ServerPort }}")
            .cluster("name: {{ .Vars.Cluster }}")
            .run(&mut p)
            .await
            .unwrap();

        let snapshot = p.control_plane().unwrap().snapshot("server").unwrap();
        assert_eq!(
            snapshot.resources,
            vec![
                Resource::listener(format!("port: {}", p.ports().server_port)),
                Resource::cluster("name: backend"),
            ]
        );

        let err = Update::new("server", "0")
            .listener("changed")
            .run(&mut p)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StaleVersion { .. }));

        xds.close().await.unwrap();
        xds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_timeout_without_proxy() {
        let mut p = params();
        let mut xds = Xds::new();
        xds.run(&mut p).await.unwrap();

        let err = Update::new("server", "1")
            .wait_for_ack(Duration::from_millis(50))
            .run(&mut p)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AckTimeout { .. }), "{:?}", err);

        xds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_ack_timeout_is_used() {
        let mut config = Config::default();
        config.timeouts.ack_secs = 1;
        let mut p = Params::new("xds_test", BTreeMap::new(), config).unwrap();
        let mut xds = Xds::new();
        xds.run(&mut p).await.unwrap();

        let update = Update::new("server", "1").await_ack();
        assert_eq!(update.ack, AckWait::Configured);
        let err = update.clone().run(&mut p).await.unwrap_err();
        match err {
            Error::AckTimeout { node, version, timeout_ms, .. } => {
                assert_eq!((node.as_str(), version.as_str()), ("server", "1"));
                assert_eq!(timeout_ms, 1000);
            }
            other => panic!("expected AckTimeout, got {:?}", other),
        }

        xds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_frees_port() {
        let mut p = params();
        let port = p.ports().xds_port;

        let mut xds = Xds::new();
        xds.run(&mut p).await.unwrap();
        xds.close().await.unwrap();

        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
