//! proxy-e2e - declarative end-to-end tests for proxies fed by a control plane
//!
//! Runs YAML scenarios that start a control-plane mock and proxies, drive
//! traffic through them and assert on responses and admin stats.

use std::path::PathBuf;

use clap::Parser;
use commands::Commands;
use proxy_e2e::common::config::Config;
use proxy_e2e::common::logging;
use proxy_e2e::{cli, commands};

#[derive(Parser)]
#[command(name = "proxy-e2e", about = "End-to-end test driver for proxies")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Configuration file (defaults to PROXY_E2E_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write a detailed log to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let guard = match &cli.log_dir {
        Some(dir) => match logging::init_with_file(dir, cli.verbose) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Error: cannot open log directory {}: {e}", dir.display());
                std::process::exit(1);
            }
        },
        None => {
            logging::init_cli(cli.verbose);
            None
        }
    };

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    let result = match config {
        Ok(config) => cli::dispatch(cli.command, config, cli.verbose).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        drop(guard);
        std::process::exit(1);
    }
}
