//! Error types for the e2e driver
//!
//! Every failure a scenario can produce is one variant here. Messages name
//! the step, port, metric or iteration involved so that a failed test is
//! diagnosable from the error text alone.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the e2e driver
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Template references undefined variable '{0}'")]
    MissingVariable(String),

    #[error("Malformed template: {0}")]
    MalformedTemplate(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    #[error("Unknown port '{0}'")]
    UnknownPort(String),

    // === Process Errors ===
    #[error("Failed to start {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("{name} not ready on admin port {port} after {timeout_ms} ms{}", format_logs(.logs))]
    StartupTimeout {
        name: String,
        port: u16,
        timeout_ms: u64,
        logs: String,
    },

    #[error("{name} exited during startup ({status}){}", format_logs(.logs))]
    ProcessExited {
        name: String,
        status: String,
        logs: String,
    },

    // === Control Plane Errors ===
    #[error("Control plane is not running. Add an xds step before this one")]
    ControlPlaneNotRunning,

    #[error("Control plane failed to bind {addr}: {source}")]
    ControlPlaneBind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Control plane communication error: {0}")]
    ControlPlane(String),

    #[error("Node '{node}' is already at version '{current}', refusing version '{attempted}'")]
    StaleVersion {
        node: String,
        current: String,
        attempted: String,
    },

    #[error("Node '{node}' did not acknowledge version '{version}' within {timeout_ms} ms (last ack: {last})")]
    AckTimeout {
        node: String,
        version: String,
        timeout_ms: u64,
        last: String,
    },

    #[error("Node '{node}' rejected version '{version}': {reason}")]
    Rejected {
        node: String,
        version: String,
        reason: String,
    },

    // === Assertion Errors ===
    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("{method} {url} returned {actual}, expected {expected}. Body: {body}")]
    UnexpectedStatus {
        method: String,
        url: String,
        expected: u16,
        actual: u16,
        body: String,
    },

    #[error("Stats on admin port {port} did not converge after {attempts} attempts:\n{}", format_failures(.failures))]
    StatMismatch {
        port: u16,
        attempts: u32,
        failures: Vec<StatFailure>,
    },

    // === Traffic Errors ===
    #[error("{method} {url} failed: {source}")]
    Http {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    // === Composite Errors ===
    #[error("iteration {iteration}/{total} failed: {source}")]
    Iteration {
        iteration: usize,
        total: usize,
        #[source]
        source: Box<Error>,
    },

    #[error("step {index} ({kind}) failed: {source}{}", format_logs(.logs))]
    Step {
        index: usize,
        kind: &'static str,
        #[source]
        source: Box<Error>,
        logs: String,
    },

    #[error("Scenario '{scenario}' exceeded its deadline of {secs} seconds")]
    DeadlineExceeded { scenario: String, secs: u64 },

    #[error("Teardown failed: {0}")]
    Teardown(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of errors, used by callers that decide policy
/// (retry, fail the test, log and continue) without matching every variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Config,
    StartupTimeout,
    Assertion,
    Teardown,
    Deadline,
    Io,
    Internal,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Config => "CONFIG_ERROR",
            Category::StartupTimeout => "STARTUP_TIMEOUT",
            Category::Assertion => "ASSERTION_FAILURE",
            Category::Teardown => "TEARDOWN_ERROR",
            Category::Deadline => "DEADLINE_EXCEEDED",
            Category::Io => "IO_ERROR",
            Category::Internal => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// One metric that failed to match, with the last value seen for it
#[derive(Debug, Clone, PartialEq)]
pub struct StatFailure {
    pub name: String,
    pub expected: String,
    /// `None` when the metric was absent from the last scrape
    pub observed: Option<String>,
}

impl fmt::Display for StatFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected {}, last observed {}",
            self.name,
            self.expected,
            self.observed.as_deref().unwrap_or("<absent>")
        )
    }
}

fn format_failures(failures: &[StatFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("  {}", f))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_logs(logs: &str) -> String {
    if logs.trim().is_empty() {
        String::new()
    } else {
        format!("\n--- captured output ---\n{}", logs.trim_end())
    }
}

impl Error {
    /// Classify this error into the driver's failure taxonomy
    ///
    /// Composite errors report the category of the failure they wrap.
    pub fn category(&self) -> Category {
        match self {
            Error::MissingVariable(_)
            | Error::MalformedTemplate(_)
            | Error::Config(_)
            | Error::ConfigParse(_)
            | Error::FileRead { .. }
            | Error::UnknownPort(_)
            | Error::ControlPlaneNotRunning
            | Error::Yaml(_) => Category::Config,
            Error::SpawnFailed { .. }
            | Error::StartupTimeout { .. }
            | Error::ProcessExited { .. }
            | Error::ControlPlaneBind { .. } => Category::StartupTimeout,
            Error::Assertion(_)
            | Error::UnexpectedStatus { .. }
            | Error::StatMismatch { .. }
            | Error::StaleVersion { .. }
            | Error::AckTimeout { .. }
            | Error::Rejected { .. }
            | Error::Http { .. } => Category::Assertion,
            Error::Teardown(_) => Category::Teardown,
            Error::DeadlineExceeded { .. } => Category::Deadline,
            Error::Iteration { source, .. } | Error::Step { source, .. } => source.category(),
            Error::Io(_) | Error::ControlPlane(_) => Category::Io,
            Error::Json(_) | Error::Internal(_) => Category::Internal,
        }
    }

    /// Create a spawn failure error
    pub fn spawn_failed(name: &str, reason: impl fmt::Display) -> Self {
        Self::SpawnFailed {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a file read error for `path`
    pub fn file_read(path: &std::path::Path, error: io::Error) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            error: error.to_string(),
        }
    }

    /// The innermost error, looking through step and iteration wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Iteration { source, .. } | Error::Step { source, .. } => source.root(),
            other => other,
        }
    }
}
