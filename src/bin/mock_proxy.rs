//! Mock proxy binary for integration testing
//!
//! Stands in for a real proxy so scenarios can run without one. It reads a
//! YAML bootstrap from `-c <path>`, serves admin `/ready` and `/stats`,
//! subscribes to the control plane and serves the listeners it receives.
//! A listener echoes requests, or forwards them to a cluster when it names
//! one.
//!
//! Bootstrap:
//!
//! ```yaml
//! node: { id: server }
//! admin: { port: 15000 }
//! control_plane: { port: 18000 }   # optional
//! ready_delay_ms: 0                # optional
//! exit_code: 3                     # optional, exit at once
//! ```
//!
//! Listener resource: `{ name, port, cluster? }`. Cluster resource: `{ name, port }`.
//!
//! With a control plane configured, `/ready` stays 503 until the first
//! snapshot has been applied or rejected.

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use proxy_e2e::cli::shutdown_signal;
use proxy_e2e::controlplane::{ControlPlaneClient, ResourceType, Snapshot};
use proxy_e2e::{Error, Result};

/// Delay before reconnecting to the control plane
const RECONNECT_DELAY: Duration = Duration::from_millis(200);

#[derive(Deserialize)]
struct Bootstrap {
    node: NodeDecl,
    admin: PortDecl,
    control_plane: Option<PortDecl>,
    #[serde(default)]
    ready_delay_ms: u64,
    exit_code: Option<i32>,
}

#[derive(Deserialize)]
struct NodeDecl {
    id: String,
}

#[derive(Deserialize)]
struct PortDecl {
    port: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
struct ListenerDecl {
    name: String,
    port: u16,
    cluster: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
struct ClusterDecl {
    name: String,
    port: u16,
}

/// State shared by the admin server, listeners and the control-plane loop
struct Shared {
    started: Instant,
    ready_delay: Duration,
    /// Set once the first snapshot was applied or rejected
    initialized: AtomicBool,
    counters: Mutex<BTreeMap<String, u64>>,
    text: Mutex<BTreeMap<String, String>>,
    routes: Mutex<HashMap<String, ListenerDecl>>,
    clusters: Mutex<HashMap<String, ClusterDecl>>,
    /// Client used to relay requests to clusters
    http: reqwest::Client,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn new(ready_delay: Duration, needs_config: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        let shared = Self {
            started: Instant::now(),
            ready_delay,
            initialized: AtomicBool::new(!needs_config),
            counters: Mutex::default(),
            text: Mutex::default(),
            routes: Mutex::default(),
            clusters: Mutex::default(),
            http,
        };
        for name in [
            "lds.update_success",
            "lds.update_rejected",
            "control_plane.connected_state",
            "cluster_manager.active_clusters",
            "listener_manager.total_listeners_active",
        ] {
            shared.set(name, 0);
        }
        Ok(shared)
    }

    fn ready(&self) -> bool {
        self.started.elapsed() >= self.ready_delay && self.initialized.load(Ordering::SeqCst)
    }

    fn incr(&self, name: &str) {
        *lock(&self.counters).entry(name.to_string()).or_insert(0) += 1;
    }

    fn set(&self, name: &str, value: u64) {
        lock(&self.counters).insert(name.to_string(), value);
    }

    fn set_text(&self, name: &str, value: &str) {
        lock(&self.text).insert(name.to_string(), value.to_string());
    }

    fn render_stats(&self) -> String {
        let mut out = String::new();
        for (name, value) in lock(&self.counters).iter() {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        for (name, value) in lock(&self.text).iter() {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        out
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("mock_proxy: {}", e);
        std::process::exit(1);
    }
}

fn bootstrap_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "-c" {
            return args
                .next()
                .map(PathBuf::from)
                .ok_or_else(|| Error::Config("-c needs a path".to_string()));
        }
    }
    Err(Error::Config("usage: mock_proxy [args..] -c <bootstrap>".to_string()))
}

async fn run() -> Result<()> {
    let path = bootstrap_path()?;
    let content = std::fs::read_to_string(&path).map_err(|e| Error::file_read(&path, e))?;
    let bootstrap: Bootstrap = serde_yaml::from_str(&content)?;

    if let Some(code) = bootstrap.exit_code {
        eprintln!("exiting with status {} as configured", code);
        std::process::exit(code);
    }

    let shared = Arc::new(Shared::new(
        Duration::from_millis(bootstrap.ready_delay_ms),
        bootstrap.control_plane.is_some(),
    )?);
    shared.set_text("server.node_id", &bootstrap.node.id);

    let admin = TcpListener::bind(("127.0.0.1", bootstrap.admin.port)).await?;
    let admin_shared = shared.clone();
    tokio::spawn(serve_http(admin, "admin".to_string(), move |req| {
        handle_admin(req, admin_shared.clone())
    }));

    if let Some(cp) = &bootstrap.control_plane {
        let addr = SocketAddr::from(([127, 0, 0, 1], cp.port));
        tokio::spawn(follow_control_plane(addr, bootstrap.node.id.clone(), shared.clone()));
    }

    println!(
        "mock proxy '{}' started, admin on {}",
        bootstrap.node.id, bootstrap.admin.port
    );
    tracing::info!(node = %bootstrap.node.id, "waiting for SIGTERM");

    shutdown_signal().await;
    println!("mock proxy '{}' shutting down", bootstrap.node.id);
    Ok(())
}

// === Control plane ===

async fn follow_control_plane(addr: SocketAddr, node: String, shared: Arc<Shared>) {
    let mut running: HashMap<String, (u16, JoinHandle<()>)> = HashMap::new();

    loop {
        match ControlPlaneClient::connect(addr).await {
            Ok(client) => match client.subscribe(&node).await {
                Ok(mut subscription) => {
                    shared.set("control_plane.connected_state", 1);
                    while let Ok(Some(snapshot)) = subscription.next_snapshot().await {
                        let reply = match apply(&snapshot, &shared, &mut running).await {
                            Ok(()) => {
                                shared.incr("lds.update_success");
                                shared.set_text("lds.version_text", &snapshot.version);
                                println!("applied version {}", snapshot.version);
                                subscription.ack(&snapshot.version).await
                            }
                            Err(reason) => {
                                shared.incr("lds.update_rejected");
                                eprintln!("rejected version {}: {}", snapshot.version, reason);
                                subscription.nack(&snapshot.version, &reason).await
                            }
                        };
                        shared.initialized.store(true, Ordering::SeqCst);
                        if reply.is_err() {
                            break;
                        }
                    }
                    shared.set("control_plane.connected_state", 0);
                }
                Err(e) => tracing::debug!("subscribe failed: {}", e),
            },
            Err(e) => tracing::debug!("control plane not reachable: {}", e),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Install a snapshot; on error nothing changes
async fn apply(
    snapshot: &Snapshot,
    shared: &Arc<Shared>,
    running: &mut HashMap<String, (u16, JoinHandle<()>)>,
) -> std::result::Result<(), String> {
    let listeners = snapshot
        .of_type(ResourceType::Listener)
        .map(|r| serde_yaml::from_str::<ListenerDecl>(&r.body))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid listener: {}", e))?;
    let clusters = snapshot
        .of_type(ResourceType::Cluster)
        .map(|r| serde_yaml::from_str::<ClusterDecl>(&r.body))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid cluster: {}", e))?;

    let mut bound = Vec::new();
    for listener in &listeners {
        let unchanged = matches!(running.get(&listener.name), Some((port, _)) if *port == listener.port);
        if !unchanged {
            let socket = TcpListener::bind(("127.0.0.1", listener.port))
                .await
                .map_err(|e| format!("listener '{}' cannot bind {}: {}", listener.name, listener.port, e))?;
            bound.push((listener.name.clone(), listener.port, socket));
        }
    }

    *lock(&shared.clusters) = clusters.into_iter().map(|c| (c.name.clone(), c)).collect();
    *lock(&shared.routes) = listeners.iter().map(|l| (l.name.clone(), l.clone())).collect();

    running.retain(|name, (port, task)| {
        let keep = listeners.iter().any(|l| &l.name == name && l.port == *port);
        if !keep {
            task.abort();
        }
        keep
    });
    for (name, port, socket) in bound {
        let task = tokio::spawn(serve_listener(socket, name.clone(), shared.clone()));
        running.insert(name, (port, task));
    }

    shared.set("cluster_manager.active_clusters", lock(&shared.clusters).len() as u64);
    shared.set("listener_manager.total_listeners_active", running.len() as u64);
    Ok(())
}

// === Data plane ===

async fn serve_listener(listener: TcpListener, name: String, shared: Arc<Shared>) {
    let handler = {
        let name = name.clone();
        move |req| handle_downstream(req, name.clone(), shared.clone())
    };
    serve_http(listener, name, handler).await
}

/// Echo the request, or relay it when the listener routes to a cluster
async fn handle_downstream(req: Request<Incoming>, name: String, shared: Arc<Shared>) -> Reply {
    shared.incr(&format!("listener.{}.downstream_rq_total", name));

    let (parts, body) = req.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let response = match body.collect().await {
        Ok(collected) => {
            let body = collected.to_bytes();
            let cluster = lock(&shared.routes).get(&name).and_then(|l| l.cluster.clone());
            match cluster {
                Some(cluster) => forward(parts.method, &target, body, &cluster, &shared).await,
                None => {
                    let mut echo = format!("{} {}\n", parts.method, target).into_bytes();
                    echo.extend_from_slice(&body);
                    reply(StatusCode::OK, echo)
                }
            }
        }
        Err(e) => reply(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e)),
    };

    shared.incr(&format!(
        "listener.{}.downstream_rq_{}xx",
        name,
        response.status().as_u16() / 100
    ));
    response
}

async fn forward(method: Method, target: &str, body: Bytes, cluster: &str, shared: &Shared) -> Reply {
    let upstream = lock(&shared.clusters).get(cluster).map(|c| c.port);
    let Some(port) = upstream else {
        return reply(StatusCode::SERVICE_UNAVAILABLE, "no healthy upstream");
    };
    shared.incr(&format!("cluster.{}.upstream_rq_total", cluster));

    let url = format!("http://127.0.0.1:{}{}", port, target);
    let relayed = async {
        let response = shared.http.request(method, url).body(body).send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok::<_, reqwest::Error>((status, body))
    };

    match relayed.await {
        Ok((status, body)) => {
            shared.incr(&format!(
                "cluster.{}.upstream_rq_{}xx",
                cluster,
                status.as_u16() / 100
            ));
            reply(status, body)
        }
        Err(e) => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("upstream connect error: {}", e),
        ),
    }
}

// === Admin ===

async fn handle_admin(req: Request<Incoming>, shared: Arc<Shared>) -> Reply {
    match req.uri().path() {
        "/ready" if shared.ready() => reply(StatusCode::OK, "LIVE\n"),
        "/ready" => reply(StatusCode::SERVICE_UNAVAILABLE, "PRE_INITIALIZING\n"),
        "/stats" => reply(StatusCode::OK, shared.render_stats()),
        _ => reply(StatusCode::NOT_FOUND, "not found\n"),
    }
}

// === HTTP ===

type Reply = Response<Full<Bytes>>;

fn reply(status: StatusCode, body: impl Into<Bytes>) -> Reply {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Serve HTTP/1.1 on every accepted connection until the task is aborted
async fn serve_http<H, F>(listener: TcpListener, label: String, handler: H)
where
    H: Fn(Request<Incoming>) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Reply> + Send + 'static,
{
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!(listener = %label, "accept failed: {}", e);
                continue;
            }
        };

        let handler = handler.clone();
        let label = label.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = handler(req);
                async move { Ok::<_, Infallible>(response.await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(listener = %label, "connection error: {}", e);
            }
        });
    }
}
