//! Configuration file handling

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Environment variable naming the proxy binary when the config does not
pub const PROXY_PATH_ENV: &str = "ENVOY_PATH";

/// Binary looked up on `PATH` as a last resort
const DEFAULT_PROXY_BINARY: &str = "envoy";

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Proxy-under-test settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Teardown policy
    #[serde(default)]
    pub teardown: TeardownConfig,
}

/// How to launch the proxy under test
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Path to the proxy executable
    pub path: Option<PathBuf>,

    /// Arguments placed before `-c <bootstrap>`
    #[serde(default)]
    pub args: Vec<String>,

    /// Lines of stdout/stderr kept per process for failure reports
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            max_log_lines: default_max_log_lines(),
        }
    }
}

fn default_max_log_lines() -> usize {
    500
}

/// Timeout settings
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Bound on waiting for a proxy admin endpoint to report ready
    #[serde(default = "default_startup")]
    pub startup_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown")]
    pub shutdown_secs: u64,

    /// Per-request timeout for generated traffic
    #[serde(default = "default_request")]
    pub request_secs: u64,

    /// Bound on stats convergence
    #[serde(default = "default_stats")]
    pub stats_secs: u64,

    /// First delay between stats scrapes; doubles up to one second
    #[serde(default = "default_stats_poll")]
    pub stats_poll_ms: u64,

    /// Bound on waiting for a node to acknowledge a pushed version
    #[serde(default = "default_ack")]
    pub ack_secs: u64,

    /// Deadline for a whole scenario
    #[serde(default = "default_scenario")]
    pub scenario_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup_secs: default_startup(),
            shutdown_secs: default_shutdown(),
            request_secs: default_request(),
            stats_secs: default_stats(),
            stats_poll_ms: default_stats_poll(),
            ack_secs: default_ack(),
            scenario_secs: default_scenario(),
        }
    }
}

fn default_startup() -> u64 {
    10
}
fn default_shutdown() -> u64 {
    5
}
fn default_request() -> u64 {
    5
}
fn default_stats() -> u64 {
    10
}
fn default_stats_poll() -> u64 {
    100
}
fn default_ack() -> u64 {
    10
}
fn default_scenario() -> u64 {
    120
}

impl Timeouts {
    pub fn startup(&self) -> Duration {
        Duration::from_secs(self.startup_secs)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn stats(&self) -> Duration {
        Duration::from_secs(self.stats_secs)
    }

    pub fn stats_poll(&self) -> Duration {
        Duration::from_millis(self.stats_poll_ms.max(1))
    }

    pub fn ack(&self) -> Duration {
        Duration::from_secs(self.ack_secs)
    }

    pub fn scenario(&self) -> Duration {
        Duration::from_secs(self.scenario_secs)
    }
}

/// Teardown policy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TeardownConfig {
    /// Fail an otherwise passing scenario when any step fails to close
    #[serde(default)]
    pub strict: bool,
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Resolve the proxy executable
    ///
    /// Explicit configuration first, then `ENVOY_PATH`, then `envoy` on `PATH`.
    pub fn proxy_binary(&self) -> Result<PathBuf> {
        if let Some(path) = &self.proxy.path {
            return Ok(path.clone());
        }

        if let Ok(path) = std::env::var(PROXY_PATH_ENV) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }

        which::which(DEFAULT_PROXY_BINARY).map_err(|_| {
            Error::Config(format!(
                "Proxy binary not found. Set [proxy].path in the config file, {} in the environment, or put '{}' on PATH",
                PROXY_PATH_ENV, DEFAULT_PROXY_BINARY
            ))
        })
    }

    /// Use `path` as the proxy executable
    pub fn with_proxy(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy.path = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.timeouts.startup_secs, 10);
        assert_eq!(config.timeouts.stats_poll_ms, 100);
        assert_eq!(config.proxy.max_log_lines, 500);
        assert!(!config.teardown.strict);
    }

    #[test]
    fn test_partial_config_overrides() {
        let config = Config::parse(
            r#"
[proxy]
path = "/opt/envoy/bin/envoy"
args = ["--concurrency", "1"]

[timeouts]
startup_secs = 30

[teardown]
strict = true
"#,
        )
        .unwrap();

        assert_eq!(
            config.proxy_binary().unwrap(),
            PathBuf::from("/opt/envoy/bin/envoy")
        );
        assert_eq!(config.proxy.args, vec!["--concurrency", "1"]);
        assert_eq!(config.timeouts.startup(), Duration::from_secs(30));
        assert_eq!(config.timeouts.shutdown_secs, 5);
        assert!(config.teardown.strict);
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let err = Config::parse("[timeouts]\nstartup_secs = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/proxy-e2e.toml")).unwrap_err();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
