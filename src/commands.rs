//! CLI command definitions
//!
//! Defines the clap commands for the proxy-e2e CLI.

use clap::Subcommand;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::common::parse_key_value;

/// Default control-plane port for `xds`
pub const DEFAULT_XDS_PORT: u16 = 18000;

#[derive(Subcommand)]
pub enum Commands {
    /// Run one or more YAML scenario files
    Run {
        /// Scenario files to run, in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Set a template variable, overriding the scenario file
        /// Can be specified multiple times: --var RequestCount=10 --var Node=server
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Proxy binary to run (overrides the config file and ENVOY_PATH)
        #[arg(long)]
        proxy: Option<PathBuf>,

        /// Keep going after a failed scenario
        #[arg(long)]
        keep_going: bool,
    },

    /// Run a standalone control-plane mock until interrupted
    Xds {
        /// Port to listen on
        #[arg(long, short, default_value_t = DEFAULT_XDS_PORT)]
        port: u16,

        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,
    },

    /// Push a snapshot to a running control plane
    Push {
        /// Control-plane address
        #[arg(long, default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_XDS_PORT)))]
        addr: SocketAddr,

        /// Node the snapshot is for
        #[arg(long)]
        node: String,

        /// Snapshot version; must be greater than the one served
        #[arg(long)]
        version: String,

        /// Listener template file (repeatable)
        #[arg(long = "listener")]
        listeners: Vec<PathBuf>,

        /// Cluster template file (repeatable)
        #[arg(long = "cluster")]
        clusters: Vec<PathBuf>,

        /// Template variable (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Port visible to templates as Ports.NAME (repeatable)
        #[arg(long = "port", value_parser = parse_port)]
        ports: Vec<(String, u16)>,
    },

    /// Render a template with freshly allocated ports and print it
    Render {
        /// Template file
        template: PathBuf,

        /// Template variable (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
}

fn parse_var(pair: &str) -> Result<(String, String), String> {
    parse_key_value(pair).ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))
}

fn parse_port(pair: &str) -> Result<(String, u16), String> {
    let (name, port) = parse_var(pair)?;
    let port = port
        .parse()
        .map_err(|_| format!("'{}' is not a port number", port))?;
    Ok((name, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("ServerPort=10000"), Ok(("ServerPort".to_string(), 10000)));
        assert!(parse_port("ServerPort=http").is_err());
        assert!(parse_var("nothing").is_err());
    }
}
