//! Proxy steps

use std::time::Duration;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::params::{Params, PortRef};
use crate::scenario::Lifecycle;
use crate::supervisor::{ProxyProcess, ProxySpec};

/// Run one proxy on a rendered bootstrap until closed
///
/// Closing stops and releases the process, so the step can run again.
pub struct Envoy {
    pub name: String,
    /// Bootstrap template
    pub bootstrap: String,
    pub admin_port: PortRef,
    /// Arguments appended after the configured proxy arguments
    pub args: Vec<String>,
    process: Option<ProxyProcess>,
    /// Output of the last stopped process
    last_logs: Option<String>,
}

impl Envoy {
    pub fn new(name: impl Into<String>, bootstrap: impl Into<String>, admin_port: impl Into<PortRef>) -> Self {
        Self {
            name: name.into(),
            bootstrap: bootstrap.into(),
            admin_port: admin_port.into(),
            args: Vec::new(),
            process: None,
            last_logs: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Spawn the process without waiting for readiness
    fn start(&mut self, params: &Params) -> Result<()> {
        if self.process.is_some() {
            return Err(Error::Config(format!("proxy '{}' already started", self.name)));
        }

        let bootstrap = params.render(&self.bootstrap)?;
        let admin_port = params.port(&self.admin_port)?;
        let spec = ProxySpec::from_config(params.config(), &self.name, bootstrap, admin_port, &self.args)?;
        self.process = Some(ProxyProcess::spawn(spec)?);
        Ok(())
    }

    async fn wait_ready(&mut self, http: &reqwest::Client, timeout: Duration) -> Result<()> {
        match self.process.as_mut() {
            Some(process) => process.wait_ready(http, timeout).await,
            None => Err(Error::Internal(format!("proxy '{}' was not started", self.name))),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProxyProcess::pid)
    }
}

#[async_trait]
impl Lifecycle for Envoy {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        self.start(params)?;
        let timeout = params.clamp(params.config().timeouts.startup());
        self.wait_ready(params.http(), timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };
        let stopped = process.stop().await;
        self.last_logs = Some(process.logs());
        stopped
    }

    fn kind(&self) -> &'static str {
        "envoy"
    }

    fn diagnostics(&self) -> Option<String> {
        let logs = match &self.process {
            Some(process) => process.logs(),
            None => self.last_logs.clone()?,
        };
        Some(format!("[{}]\n{}", self.name, logs))
    }
}

/// A client-side and a server-side proxy started as a pair
///
/// The server starts first, then the client; both are then awaited for
/// readiness concurrently. Closing stops the client before the server.
pub struct ClientServerEnvoy {
    pub client: Envoy,
    pub server: Envoy,
}

impl ClientServerEnvoy {
    /// Pair with admin ports `ClientAdmin` and `ServerAdmin`
    pub fn new(client_bootstrap: impl Into<String>, server_bootstrap: impl Into<String>) -> Self {
        Self {
            client: Envoy::new("client", client_bootstrap, "ClientAdmin"),
            server: Envoy::new("server", server_bootstrap, "ServerAdmin"),
        }
    }
}

#[async_trait]
impl Lifecycle for ClientServerEnvoy {
    async fn run(&mut self, params: &mut Params) -> Result<()> {
        self.server.start(params)?;
        self.client.start(params)?;

        let timeout = params.clamp(params.config().timeouts.startup());
        let http = params.http();
        futures_util::future::try_join(
            self.server.wait_ready(http, timeout),
            self.client.wait_ready(http, timeout),
        )
        .await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let client = self.client.close().await;
        let server = self.server.close().await;
        client.and(server)
    }

    fn kind(&self) -> &'static str {
        "client_server_envoy"
    }

    fn diagnostics(&self) -> Option<String> {
        let logs: Vec<String> = [self.client.diagnostics(), self.server.diagnostics()]
            .into_iter()
            .flatten()
            .collect();
        if logs.is_empty() {
            None
        } else {
            Some(logs.join("\n"))
        }
    }
}
