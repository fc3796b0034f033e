//! One supervised proxy process

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::common::{Error, Result};

use super::output::{capture, LogBuffer};

/// Interval between admin readiness checks
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on a single readiness check
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bound on waiting for output readers after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to launch a proxy
#[derive(Debug, Clone)]
pub struct ProxySpec {
    /// Name used in logs and errors (`envoy`, `client`, `server`)
    pub name: String,
    pub binary: PathBuf,
    /// Arguments placed before `-c <bootstrap>`
    pub args: Vec<String>,
    /// Rendered bootstrap configuration
    pub bootstrap: String,
    pub admin_port: u16,
    pub max_log_lines: usize,
    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout: Duration,
}

/// A running proxy with captured output
///
/// The child is killed if this value is dropped without [`ProxyProcess::stop`].
pub struct ProxyProcess {
    name: String,
    admin_port: u16,
    shutdown_timeout: Duration,
    child: Option<Child>,
    pid: Option<u32>,
    logs: Arc<LogBuffer>,
    readers: Vec<JoinHandle<()>>,
    _bootstrap: NamedTempFile,
}

impl ProxyProcess {
    /// Write the bootstrap to a temp file and start the proxy on it
    pub fn spawn(spec: ProxySpec) -> Result<Self> {
        let mut bootstrap = tempfile::Builder::new()
            .prefix(&format!("{}-bootstrap-", spec.name))
            .suffix(".yaml")
            .tempfile()?;
        bootstrap.write_all(spec.bootstrap.as_bytes())?;
        bootstrap.flush()?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .arg("-c")
            .arg(bootstrap.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::spawn_failed(&spec.name, format!("{}: {}", spec.binary.display(), e))
        })?;
        let pid = child.id();

        let logs = Arc::new(LogBuffer::new(spec.max_log_lines));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(capture(stdout, "stdout", logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(capture(stderr, "stderr", logs.clone()));
        }

        tracing::info!(
            proxy = %spec.name,
            pid = ?pid,
            admin_port = spec.admin_port,
            bootstrap = %bootstrap.path().display(),
            "Proxy started"
        );

        Ok(Self {
            name: spec.name,
            admin_port: spec.admin_port,
            shutdown_timeout: spec.shutdown_timeout,
            child: Some(child),
            pid,
            logs,
            readers,
            _bootstrap: bootstrap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn admin_port(&self) -> u16 {
        self.admin_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Captured output so far
    pub fn logs(&self) -> String {
        self.logs.render()
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    /// Poll the admin `/ready` endpoint until it answers 200
    ///
    /// Fails early with `ProcessExited` if the proxy dies while starting and
    /// with `StartupTimeout` once `timeout` elapses.
    pub async fn wait_ready(&mut self, http: &reqwest::Client, timeout: Duration) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/ready", self.admin_port);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    self.drain().await;
                    return Err(Error::ProcessExited {
                        name: self.name.clone(),
                        status: status.to_string(),
                        logs: self.logs.render(),
                    });
                }
            }

            match http.get(&url).timeout(READY_PROBE_TIMEOUT).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    tracing::info!(
                        proxy = %self.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Proxy ready"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    tracing::trace!(proxy = %self.name, status = %resp.status(), "Not ready yet");
                }
                Err(e) => {
                    tracing::trace!(proxy = %self.name, "Admin not reachable yet: {}", e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::StartupTimeout {
                    name: self.name.clone(),
                    port: self.admin_port,
                    timeout_ms: timeout.as_millis() as u64,
                    logs: self.logs.render(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Terminate the process and flush its output to the log
    ///
    /// Sends SIGTERM, waits up to the shutdown timeout, then kills. Safe to
    /// call repeatedly; later calls do nothing.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.drain().await;
            return Ok(());
        };

        if child.try_wait()?.is_none() {
            terminate(&mut child, &self.name);
            match tokio::time::timeout(self.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(proxy = %self.name, %status, "Proxy stopped");
                }
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => {
                    tracing::warn!(
                        proxy = %self.name,
                        timeout_secs = self.shutdown_timeout.as_secs(),
                        "Proxy ignored SIGTERM, killing"
                    );
                    child.kill().await?;
                }
            }
        }

        self.drain().await;
        for line in self.logs.lines() {
            tracing::debug!(proxy = %self.name, "{}", line);
        }
        Ok(())
    }

    /// Wait for the output readers to reach EOF
    async fn drain(&mut self) {
        for reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, reader).await.is_err() {
                tracing::debug!(proxy = %self.name, "Output reader did not finish");
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child, name: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: pid belongs to a child we have not yet reaped
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::debug!(proxy = name, pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, name: &str) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(proxy = name, "Kill failed: {}", e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(script: &str, admin_port: u16) -> ProxySpec {
        ProxySpec {
            name: "sh".to_string(),
            binary: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string(), "proxy".to_string()],
            bootstrap: "admin: {}\n".to_string(),
            admin_port,
            max_log_lines: 50,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn unused_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_early_exit_reports_logs() {
        // sh -c '<script>' proxy -c <file>: $2 is the bootstrap path
        let mut proc = ProxyProcess::spawn(spec("echo bad bootstrap $2 >&2; exit 3", unused_port())).unwrap();

        let err = proc
            .wait_ready(&reqwest::Client::new(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::ProcessExited { status, logs, .. } => {
                assert!(status.contains('3'), "{status}");
                assert!(logs.contains("[stderr] bad bootstrap"), "{logs}");
            }
            other => panic!("expected ProcessExited, got {:?}", other),
        }
        proc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_timeout_and_stop() {
        let mut proc = ProxyProcess::spawn(spec("echo waiting; exec sleep 30", unused_port())).unwrap();
        assert!(proc.is_running());

        let err = proc
            .wait_ready(&reqwest::Client::new(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartupTimeout { .. }), "{:?}", err);

        proc.stop().await.unwrap();
        assert!(!proc.is_running());
        assert!(proc.logs().contains("[stdout] waiting"));
        proc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut s = spec("", 1);
        s.binary = PathBuf::from("/nonexistent/proxy-binary");
        let err = ProxyProcess::spawn(s).err().unwrap();
        assert!(matches!(err, Error::SpawnFailed { .. }));
    }
}
