//! Process supervision for the proxy under test
//!
//! Starts a proxy on a rendered bootstrap, waits for its admin endpoint,
//! keeps the tail of its output and makes sure it is gone on close.

mod output;
mod process;

pub use output::LogBuffer;
pub use process::{ProxyProcess, ProxySpec};

use crate::common::config::Config;
use crate::common::Result;

impl ProxySpec {
    /// Build a launch spec from the harness configuration
    ///
    /// `extra_args` are appended after the configured arguments.
    pub fn from_config(
        config: &Config,
        name: &str,
        bootstrap: String,
        admin_port: u16,
        extra_args: &[String],
    ) -> Result<Self> {
        let mut args = config.proxy.args.clone();
        args.extend(extra_args.iter().cloned());

        Ok(Self {
            name: name.to_string(),
            binary: config.proxy_binary()?,
            args,
            bootstrap,
            admin_port,
            max_log_lines: config.proxy.max_log_lines,
            shutdown_timeout: config.timeouts.shutdown(),
        })
    }
}
