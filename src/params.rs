//! Scenario-wide parameters
//!
//! A [`Params`] value is created once per scenario run and threaded through
//! every step. It owns the allocated ports, the template variables, the
//! scenario deadline and the handle of the running control plane. Nothing in
//! here is process-global, so scenarios running concurrently in one test
//! binary never see each other's state.

use std::collections::BTreeMap;
use std::fmt;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::controlplane::ControlPlaneHandle;
use crate::template;

/// Well-known port names, in allocation order
pub const PORT_NAMES: [&str; 6] = [
    "XDSPort",
    "ClientPort",
    "ClientAdmin",
    "ServerPort",
    "ServerAdmin",
    "BackendPort",
];

/// Local ports allocated for one scenario
///
/// All ports are distinct and fixed for the lifetime of the scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ports {
    /// Control-plane mock listener
    pub xds_port: u16,
    /// Data-plane listener of the client-side proxy
    pub client_port: u16,
    /// Admin endpoint of the client-side proxy
    pub client_admin: u16,
    /// Data-plane listener of the server-side proxy
    pub server_port: u16,
    /// Admin endpoint of the server-side proxy
    pub server_admin: u16,
    /// Backend application behind the server-side proxy
    pub backend_port: u16,
    /// Additional ports requested by name
    pub extra: BTreeMap<String, u16>,
}

impl Ports {
    /// Allocate the well-known ports plus one per name in `extra`
    ///
    /// Every listener is held until all ports are known so the kernel
    /// cannot hand out the same port twice. An extra name must be new: it
    /// may not repeat or shadow a well-known name.
    pub fn allocate(extra: &[&str]) -> Result<Self> {
        for (i, name) in extra.iter().enumerate() {
            if PORT_NAMES.contains(name) || extra[..i].contains(name) {
                return Err(Error::Config(format!("port name '{}' is already allocated", name)));
            }
        }

        let count = PORT_NAMES.len() + extra.len();
        let mut listeners = Vec::with_capacity(count);
        for _ in 0..count {
            listeners.push(TcpListener::bind("127.0.0.1:0")?);
        }

        let mut ports = listeners
            .iter()
            .map(|l| l.local_addr().map(|a| a.port()))
            .collect::<std::io::Result<Vec<u16>>>()?
            .into_iter();
        drop(listeners);

        let mut next = || {
            ports
                .next()
                .ok_or_else(|| Error::Internal("port allocation came up short".to_string()))
        };

        let mut allocated = Self {
            xds_port: next()?,
            client_port: next()?,
            client_admin: next()?,
            server_port: next()?,
            server_admin: next()?,
            backend_port: next()?,
            extra: BTreeMap::new(),
        };
        for name in extra {
            allocated.extra.insert((*name).to_string(), next()?);
        }

        tracing::debug!(ports = ?allocated.to_map(), "Allocated scenario ports");
        Ok(allocated)
    }

    /// Look up a port by its template name
    pub fn get(&self, name: &str) -> Option<u16> {
        match name {
            "XDSPort" => Some(self.xds_port),
            "ClientPort" => Some(self.client_port),
            "ClientAdmin" => Some(self.client_admin),
            "ServerPort" => Some(self.server_port),
            "ServerAdmin" => Some(self.server_admin),
            "BackendPort" => Some(self.backend_port),
            other => self.extra.get(other).copied(),
        }
    }

    /// All ports keyed by template name
    pub fn to_map(&self) -> BTreeMap<String, u16> {
        let mut map: BTreeMap<String, u16> = PORT_NAMES
            .iter()
            .filter_map(|name| self.get(name).map(|port| (name.to_string(), port)))
            .collect();
        map.extend(self.extra.iter().map(|(k, v)| (k.clone(), *v)));
        map
    }
}

/// A port given either literally or by name
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

impl PortRef {
    /// Resolve to a concrete port number
    pub fn resolve(&self, ports: &Ports) -> Result<u16> {
        match self {
            PortRef::Number(port) => Ok(*port),
            PortRef::Name(name) => ports
                .get(name)
                .ok_or_else(|| Error::UnknownPort(name.clone())),
        }
    }
}

impl From<u16> for PortRef {
    fn from(port: u16) -> Self {
        PortRef::Number(port)
    }
}

impl From<&str> for PortRef {
    fn from(name: &str) -> Self {
        PortRef::Name(name.to_string())
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRef::Number(port) => write!(f, "{}", port),
            PortRef::Name(name) => f.write_str(name),
        }
    }
}

/// The variables a template sees
#[derive(Serialize)]
struct TemplateContext<'a> {
    #[serde(rename = "Ports")]
    ports: BTreeMap<String, u16>,
    #[serde(rename = "Vars")]
    vars: &'a BTreeMap<String, String>,
}

/// Scenario-wide context passed to every step
pub struct Params {
    name: String,
    ports: Ports,
    vars: BTreeMap<String, String>,
    config: Config,
    budget: Duration,
    deadline: Instant,
    http: reqwest::Client,
    control_plane: Option<ControlPlaneHandle>,
}

impl Params {
    /// Create parameters for the scenario `name`
    ///
    /// Allocates the well-known ports; the deadline starts from the
    /// configured scenario timeout and runs from now.
    pub fn new(name: impl Into<String>, vars: BTreeMap<String, String>, config: Config) -> Result<Self> {
        Self::with_extra_ports(name, vars, config, &[])
    }

    /// Like [`Params::new`], also allocating one port per name in `extra_ports`
    pub fn with_extra_ports(
        name: impl Into<String>,
        vars: BTreeMap<String, String>,
        config: Config,
        extra_ports: &[&str],
    ) -> Result<Self> {
        let ports = Ports::allocate(extra_ports)?;
        let budget = config.timeouts.scenario();
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.into(),
            ports,
            vars,
            config,
            budget,
            deadline: Instant::now() + budget,
            http,
            control_plane: None,
        })
    }

    /// Replace the scenario deadline with `budget` from now
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self.deadline = Instant::now() + budget;
        self
    }

    /// Name of the scenario these parameters belong to
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Set a template variable
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(name.into(), value.into());
    }

    /// Resolve a port reference against this scenario's ports
    pub fn port(&self, port: &PortRef) -> Result<u16> {
        port.resolve(&self.ports)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the scenario deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Shorten `timeout` so it never outlives the scenario deadline
    pub fn clamp(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// The error reported when the scenario deadline passes
    pub fn deadline_exceeded(&self) -> Error {
        Error::DeadlineExceeded {
            scenario: self.name.clone(),
            secs: self.budget.as_secs(),
        }
    }

    /// Shared HTTP client for traffic and admin scraping
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Render `source` with this scenario's ports and variables
    pub fn render(&self, source: &str) -> Result<String> {
        let context = TemplateContext {
            ports: self.ports.to_map(),
            vars: &self.vars,
        };
        template::render(source, &context)
    }

    /// Load a template file and render it
    pub fn load_template(&self, path: &Path) -> Result<String> {
        self.render(&template::load(path)?)
    }

    /// Handle of the running control plane
    pub fn control_plane(&self) -> Result<&ControlPlaneHandle> {
        self.control_plane
            .as_ref()
            .ok_or(Error::ControlPlaneNotRunning)
    }

    /// Record the control plane started by an xds step
    pub fn set_control_plane(&mut self, handle: ControlPlaneHandle) {
        self.control_plane = Some(handle);
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Params")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("vars", &self.vars)
            .field("remaining", &self.remaining())
            .field("control_plane", &self.control_plane.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params(vars: &[(&str, &str)]) -> Params {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Params::new("params_test", vars, Config::default()).unwrap()
    }

    #[test]
    fn test_ports_are_unique() {
        let ports = Ports::allocate(&["ExtraA", "ExtraB"]).unwrap();
        let all = ports.to_map();
        assert_eq!(all.len(), PORT_NAMES.len() + 2);

        let unique: HashSet<u16> = all.values().copied().collect();
        assert_eq!(unique.len(), all.len());
        assert!(all.values().all(|p| *p != 0));
    }

    #[test]
    fn test_duplicate_port_names_are_rejected() {
        let err = Ports::allocate(&["ServerAdmin"]).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("'ServerAdmin'")), "{:?}", err);

        let err = Ports::allocate(&["Metrics", "Metrics"]).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("'Metrics'")), "{:?}", err);
    }

    #[test]
    fn test_port_ref_resolution() {
        let ports = Ports::allocate(&["Metrics"]).unwrap();

        assert_eq!(PortRef::from("ServerAdmin").resolve(&ports).unwrap(), ports.server_admin);
        assert_eq!(PortRef::from("Metrics").resolve(&ports).unwrap(), ports.extra["Metrics"]);
        assert_eq!(PortRef::from(8080).resolve(&ports).unwrap(), 8080);
        assert!(matches!(
            PortRef::from("Nope").resolve(&ports),
            Err(Error::UnknownPort(_))
        ));
    }

    #[test]
    fn test_port_ref_deserializes_from_name_or_number() {
        let by_name: PortRef = serde_yaml::from_str("ClientPort").unwrap();
        let by_number: PortRef = serde_yaml::from_str("15000").unwrap();
        assert_eq!(by_name, PortRef::Name("ClientPort".to_string()));
        assert_eq!(by_number, PortRef::Number(15000));
    }

    #[test]
    fn test_render_sees_ports_and_vars() {
        let mut p = params(&[("RequestCount", "10")]);
        p.set_var("Node", "server");

        let out = p
            .render("{{ .Vars.Node }}:{{ Ports.ServerPort }}:{{ Vars.RequestCount }}")
            .unwrap();
        assert_eq!(out, format!("server:{}:10", p.ports().server_port));
    }

    #[test]
    fn test_control_plane_required() {
        let p = params(&[]);
        assert!(matches!(p.control_plane(), Err(Error::ControlPlaneNotRunning)));
    }

    #[tokio::test]
    async fn test_clamp_respects_deadline() {
        let p = params(&[]).with_deadline(Duration::from_millis(200));
        assert!(p.clamp(Duration::from_secs(60)) <= Duration::from_millis(200));
        assert_eq!(p.clamp(Duration::from_millis(1)), Duration::from_millis(1));
    }
}
