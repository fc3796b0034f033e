//! Scenario file format
//!
//! Defines the data structures for deserializing YAML scenarios and turns
//! them into executable [`Step`]s. File references resolve relative to the
//! directory of the scenario file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::common::{Error, Result};
use crate::params::PortRef;
use crate::stats::{Number, StatMatcher};
use crate::steps::{self, AckWait, BodyMatch, Step};
use crate::template;

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug)]
pub struct TestScenario {
    /// Name of the scenario
    pub name: String,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Template variables; command-line `--var` values override these
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Extra named ports to allocate next to the well-known ones
    #[serde(default)]
    pub ports: Vec<String>,
    /// Overrides the configured scenario deadline
    pub deadline_secs: Option<u64>,
    /// The steps to execute, in order
    pub steps: Vec<StepConfig>,
}

impl TestScenario {
    /// Read and parse a scenario file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_read(path, e))?;
        serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse scenario '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Build the executable steps, resolving files against `base`
    pub fn build_steps(&self, base: &Path) -> Result<Vec<Step>> {
        self.steps.iter().map(|step| step.build(base)).collect()
    }
}

/// Bootstrap and launch options for one proxy
#[derive(Deserialize, Debug, Default)]
pub struct ProxyDecl {
    /// Inline bootstrap template
    pub bootstrap: Option<String>,
    /// Bootstrap template file
    pub bootstrap_file: Option<PathBuf>,
    /// Admin port; defaults per role
    pub admin_port: Option<PortRef>,
    /// Extra proxy arguments
    #[serde(default)]
    pub args: Vec<String>,
}

/// Expected value of one metric
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum MatcherConfig {
    /// `name: 10`, an exact integer
    Integer(i64),
    Unsigned(u64),
    /// `name: 0.5`
    Float(f64),
    /// `name: {exact: ..}`, `name: {partial: ..}` or `name: absent`
    Tagged(StatMatcher),
    /// `name: ">= {{ Vars.N }}"`, a template rendered to an expression
    Template(String),
}

impl From<&MatcherConfig> for StatMatcher {
    fn from(config: &MatcherConfig) -> Self {
        match config {
            MatcherConfig::Integer(n) => StatMatcher::exact(n),
            MatcherConfig::Unsigned(n) => StatMatcher::exact(n),
            MatcherConfig::Float(n) => StatMatcher::exact(Number::Float(*n)),
            MatcherConfig::Tagged(matcher) => matcher.clone(),
            MatcherConfig::Template(template) => StatMatcher::partial(template.clone()),
        }
    }
}

/// A single step, tagged by `action`
#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepConfig {
    /// Start the control-plane mock on XDSPort
    Xds,
    /// Push a snapshot for a node
    Update {
        node: String,
        version: String,
        #[serde(default)]
        listeners: Vec<String>,
        #[serde(default)]
        listener_files: Vec<PathBuf>,
        #[serde(default)]
        clusters: Vec<String>,
        #[serde(default)]
        cluster_files: Vec<PathBuf>,
        /// Wait for the node to ACK the version within `timeouts.ack_secs`
        #[serde(default)]
        wait_for_ack: bool,
        /// Wait this long for the node to ACK the version
        ack_timeout_ms: Option<u64>,
    },
    /// Run one proxy
    Envoy {
        #[serde(default = "default_envoy_name")]
        name: String,
        #[serde(flatten)]
        proxy: ProxyDecl,
    },
    /// Run a client and a server proxy
    ClientServerEnvoy { client: ProxyDecl, server: ProxyDecl },
    /// Send one HTTP request
    HttpCall {
        port: PortRef,
        #[serde(default = "default_path")]
        path: String,
        #[serde(default = "default_method")]
        method: String,
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_status")]
        status: u16,
        /// Response body must equal this
        body_equals: Option<String>,
        /// Response body must contain this
        body_contains: Option<String>,
    },
    /// Run a step several times
    Repeat { count: usize, step: Box<StepConfig> },
    /// Pause
    Sleep { millis: u64 },
    /// Assert on admin stats
    Stats {
        admin_port: PortRef,
        #[serde(default)]
        matchers: BTreeMap<String, MatcherConfig>,
        /// Template file of `name: expectation` lines
        partial_file: Option<PathBuf>,
        timeout_ms: Option<u64>,
    },
}

fn default_envoy_name() -> String {
    "envoy".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

fn load_all(base: &Path, inline: &[String], files: &[PathBuf]) -> Result<Vec<String>> {
    let mut templates = inline.to_vec();
    for file in files {
        templates.push(template::load(&resolve(base, file))?);
    }
    Ok(templates)
}

/// Matchers from a partial stats file, one `name: expectation` per line
fn load_partial(path: &Path) -> Result<Vec<(String, StatMatcher)>> {
    let content = template::load(path)?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| -> Result<(String, StatMatcher)> {
            let (name, expected) = line.split_once(": ").ok_or_else(|| {
                Error::Config(format!(
                    "'{}': expected 'name: value', got '{}'",
                    path.display(),
                    line
                ))
            })?;
            Ok((name.trim().to_string(), StatMatcher::partial(expected.trim())))
        })
        .collect()
}

impl ProxyDecl {
    fn build(&self, base: &Path, name: &str, default_admin: &str) -> Result<steps::Envoy> {
        let bootstrap = match (&self.bootstrap, &self.bootstrap_file) {
            (Some(inline), None) => inline.clone(),
            (None, Some(file)) => template::load(&resolve(base, file))?,
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "proxy '{}': give either bootstrap or bootstrap_file, not both",
                    name
                )))
            }
            (None, None) => {
                return Err(Error::Config(format!(
                    "proxy '{}' needs a bootstrap or bootstrap_file",
                    name
                )))
            }
        };

        let admin_port = self
            .admin_port
            .clone()
            .unwrap_or_else(|| PortRef::from(default_admin));
        let mut envoy = steps::Envoy::new(name, bootstrap, admin_port);
        envoy.args = self.args.clone();
        Ok(envoy)
    }
}

impl StepConfig {
    /// Turn this declaration into an executable step
    pub fn build(&self, base: &Path) -> Result<Step> {
        let step = match self {
            StepConfig::Xds => Step::Xds(steps::Xds::new()),
            StepConfig::Update {
                node,
                version,
                listeners,
                listener_files,
                clusters,
                cluster_files,
                wait_for_ack,
                ack_timeout_ms,
            } => Step::Update(steps::Update {
                node: node.clone(),
                version: version.clone(),
                listeners: load_all(base, listeners, listener_files)?,
                clusters: load_all(base, clusters, cluster_files)?,
                ack: match (ack_timeout_ms, wait_for_ack) {
                    (Some(ms), _) => AckWait::Within(Duration::from_millis(*ms)),
                    (None, true) => AckWait::Configured,
                    (None, false) => AckWait::Skip,
                },
            }),
            StepConfig::Envoy { name, proxy } => Step::Envoy(proxy.build(base, name, "ServerAdmin")?),
            StepConfig::ClientServerEnvoy { client, server } => {
                Step::ClientServerEnvoy(steps::ClientServerEnvoy {
                    client: client.build(base, "client", "ClientAdmin")?,
                    server: server.build(base, "server", "ServerAdmin")?,
                })
            }
            StepConfig::HttpCall {
                port,
                path,
                method,
                body,
                headers,
                status,
                body_equals,
                body_contains,
            } => {
                let expected_body = match (body_equals, body_contains) {
                    (Some(_), Some(_)) => {
                        return Err(Error::Config(
                            "http_call: give either body_equals or body_contains, not both"
                                .to_string(),
                        ))
                    }
                    (Some(exact), None) => Some(BodyMatch::Exact(exact.clone())),
                    (None, Some(needle)) => Some(BodyMatch::Contains(needle.clone())),
                    (None, None) => None,
                };
                Step::HttpCall(steps::HttpCall {
                    port: port.clone(),
                    path: path.clone(),
                    method: method.clone(),
                    body: body.clone(),
                    headers: headers.clone(),
                    expected_status: *status,
                    expected_body,
                })
            }
            StepConfig::Repeat { count, step } => {
                Step::Repeat(steps::Repeat::new(*count, step.build(base)?))
            }
            StepConfig::Sleep { millis } => {
                Step::Sleep(steps::Sleep::new(Duration::from_millis(*millis)))
            }
            StepConfig::Stats {
                admin_port,
                matchers,
                partial_file,
                timeout_ms,
            } => {
                let mut stats = steps::Stats::new(admin_port.clone());
                if let Some(file) = partial_file {
                    for (name, matcher) in load_partial(&resolve(base, file))? {
                        stats.matchers.insert(name, matcher);
                    }
                }
                for (name, matcher) in matchers {
                    stats.matchers.insert(name.clone(), matcher.into());
                }
                stats.timeout = timeout_ms.map(Duration::from_millis);
                Step::Stats(stats)
            }
        };
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Lifecycle;

    const SCENARIO: &str = r#"
name: basic_flow
description: Server proxy echoes ten requests
vars:
  RequestCount: "10"
ports: [Metrics]
steps:
  - action: xds
  - action: update
    node: server
    version: "0"
    listener_files: [listener.yaml]
    ack_timeout_ms: 2000
  - action: envoy
    bootstrap: "admin: {{ .Ports.ServerAdmin }}"
  - action: repeat
    count: 10
    step:
      action: http_call
      port: ServerPort
      path: /echo
      body_contains: echo
  - action: sleep
    millis: 10
  - action: stats
    admin_port: ServerAdmin
    matchers:
      listener.server.downstream_rq_total: "{{ .Vars.RequestCount }}"
      lds.update_success: 1
      lds.update_rejected: absent
      lds.version_text: {exact: "0"}
"#;

    #[test]
    fn test_parse_and_build() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("listener.yaml"), "name: server\n").unwrap();

        let scenario: TestScenario = serde_yaml::from_str(SCENARIO).unwrap();
        assert_eq!(scenario.name, "basic_flow");
        assert_eq!(scenario.ports, vec!["Metrics"]);

        let steps = scenario.build_steps(dir.path()).unwrap();
        let kinds: Vec<&str> = steps.iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, vec!["xds", "update", "envoy", "repeat", "sleep", "stats"]);

        match &steps[1] {
            Step::Update(update) => {
                assert_eq!(update.listeners, vec!["name: server\n"]);
                assert_eq!(update.ack, AckWait::Within(Duration::from_secs(2)));
            }
            _ => panic!("expected update"),
        }
        match &steps[5] {
            Step::Stats(stats) => {
                assert_eq!(
                    stats.matchers["listener.server.downstream_rq_total"],
                    StatMatcher::partial("{{ .Vars.RequestCount }}")
                );
                assert_eq!(stats.matchers["lds.update_success"], StatMatcher::exact(1));
                assert_eq!(stats.matchers["lds.update_rejected"], StatMatcher::Absent);
                assert_eq!(stats.matchers["lds.version_text"], StatMatcher::exact("0"));
            }
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn test_missing_file_is_reported() {
        let scenario: TestScenario = serde_yaml::from_str(SCENARIO).unwrap();
        let err = scenario
            .build_steps(Path::new("/nonexistent"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::FileRead { .. }), "{:?}", err);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("expected.stats"),
            "# counters\nhttp.ingress.rq_total: >= {{ Vars.N }}\n\ncluster.x.rq: 0\n",
        )
        .unwrap();

        let step: StepConfig = serde_yaml::from_str(
            "action: stats\nadmin_port: 15000\npartial_file: expected.stats\n",
        )
        .unwrap();
        match step.build(dir.path()).unwrap() {
            Step::Stats(stats) => {
                assert_eq!(stats.admin_port, PortRef::Number(15000));
                assert_eq!(
                    stats.matchers["http.ingress.rq_total"],
                    StatMatcher::partial(">= {{ Vars.N }}")
                );
                assert_eq!(stats.matchers.len(), 2);
            }
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn test_wait_for_ack_uses_configured_timeout() {
        let step: StepConfig = serde_yaml::from_str(
            "action: update\nnode: server\nversion: \"1\"\nwait_for_ack: true\n",
        )
        .unwrap();
        match step.build(Path::new(".")).unwrap() {
            Step::Update(update) => assert_eq!(update.ack, AckWait::Configured),
            _ => panic!("expected update"),
        }

        let step: StepConfig =
            serde_yaml::from_str("action: update\nnode: server\nversion: \"1\"\n").unwrap();
        match step.build(Path::new(".")).unwrap() {
            Step::Update(update) => assert_eq!(update.ack, AckWait::Skip),
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn test_numeric_matchers_keep_precision() {
        let step: StepConfig = serde_yaml::from_str(
            "action: stats
admin_port: ServerAdmin
matchers:
  lds.update_success: {exact: 1}
  lds.update_rejected: 0
  cluster.big.bytes: 18446744073709551615
  server.load: 0.5
",
        )
        .unwrap();
        match step.build(Path::new(".")).unwrap() {
            Step::Stats(stats) => {
                assert_eq!(stats.matchers["lds.update_success"], StatMatcher::exact(1));
                assert_eq!(stats.matchers["lds.update_rejected"], StatMatcher::exact(0));
                assert_eq!(
                    stats.matchers["cluster.big.bytes"],
                    StatMatcher::exact(u64::MAX)
                );
                assert_eq!(stats.matchers["server.load"], StatMatcher::exact("0.5"));
            }
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn test_bootstrap_required() {
        let step: StepConfig = serde_yaml::from_str("action: envoy\n").unwrap();
        assert!(matches!(step.build(Path::new(".")), Err(Error::Config(_))));
    }
}
