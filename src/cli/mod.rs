//! CLI command handling
//!
//! Dispatches CLI commands and formats output.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use colored::Colorize;
use serde::Serialize;

use crate::commands::Commands;
use crate::common::config::Config;
use crate::common::{Error, Result};
use crate::controlplane::{ControlPlane, ControlPlaneClient, Resource};
use crate::params::Params;
use crate::template;
use crate::testing::{self, TestResult};

/// Dispatch a CLI command
pub async fn dispatch(command: Commands, config: Config, verbose: bool) -> Result<()> {
    match command {
        Commands::Run {
            paths,
            vars,
            proxy,
            keep_going,
        } => {
            let config = match proxy {
                Some(path) => config.with_proxy(path),
                None => config,
            };
            let vars: BTreeMap<String, String> = vars.into_iter().collect();
            run_scenarios(&paths, &vars, &config, verbose, keep_going).await
        }

        Commands::Xds { port, host } => {
            let mut server = ControlPlane::bind(SocketAddr::new(host, port)).await?;
            println!("Control plane listening on {}", server.local_addr());
            shutdown_signal().await;
            server.shutdown().await
        }

        Commands::Push {
            addr,
            node,
            version,
            listeners,
            clusters,
            vars,
            ports,
        } => {
            #[derive(Serialize)]
            struct Context {
                #[serde(rename = "Vars")]
                vars: BTreeMap<String, String>,
                #[serde(rename = "Ports")]
                ports: BTreeMap<String, u16>,
            }
            let context = Context {
                vars: vars.into_iter().collect(),
                ports: ports.into_iter().collect(),
            };

            let mut resources = Vec::with_capacity(listeners.len() + clusters.len());
            for path in &listeners {
                resources.push(Resource::listener(template::render(&template::load(path)?, &context)?));
            }
            for path in &clusters {
                resources.push(Resource::cluster(template::render(&template::load(path)?, &context)?));
            }

            let mut client = ControlPlaneClient::connect(addr).await?;
            client.push(&node, &version, resources).await?;
            println!("Pushed version {} for node {}", version, node);
            Ok(())
        }

        Commands::Render { template, vars } => {
            let params = Params::new("render", vars.into_iter().collect(), config)?;
            print!("{}", params.load_template(&template)?);
            Ok(())
        }
    }
}

async fn run_scenarios(
    paths: &[PathBuf],
    vars: &BTreeMap<String, String>,
    config: &Config,
    verbose: bool,
    keep_going: bool,
) -> Result<()> {
    let mut results: Vec<TestResult> = Vec::with_capacity(paths.len());

    for path in paths {
        let result = testing::run_scenario(path, verbose, vars, config).await?;
        let passed = result.passed;
        results.push(result);
        if !passed && !keep_going {
            break;
        }
    }

    let failed: Vec<&TestResult> = results.iter().filter(|r| !r.passed).collect();
    if paths.len() > 1 {
        println!("{}", "Summary:".cyan());
        for result in &results {
            let mark = if result.passed { "✓".green() } else { "✗".red() };
            println!("  {} {}", mark, result.name);
        }
        let skipped = paths.len() - results.len();
        if skipped > 0 {
            println!("  {} not run", skipped.to_string().dimmed());
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(Error::Assertion(format!(
            "{} of {} scenarios failed",
            failed.len(),
            paths.len()
        )))
    }
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT (Ctrl+C), shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, shutting down");
    }
}
