//! C7: the service registry the X-Client's [`crate::discovery::RegistryDiscovery`]
//! polls. An ordinary HTTP service — not RPC-framed, so it is built on the
//! published `hyper` crate directly rather than this crate's own codec —
//! holding `{addr -> lastHeartbeat}` with TTL-based, lazily-swept
//! liveness.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server as HyperServer, StatusCode};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// `defaultTimeout` from the original's `registry.go`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

struct Entry {
    last_heartbeat: Instant,
}

/// `{addr -> lastHeartbeat}`, guarded by a mutex, swept lazily: an entry
/// that has outlived `timeout` is only actually removed the next time
/// [`Registry::alive_servers`] runs.
pub struct Registry {
    name: String,
    timeout: Duration,
    servers: StdMutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Registry {
    /// `name` determines both the mount path (`/_<name>_/registry`) and
    /// the header names (`X-<name>-Server(s)`) this registry speaks.
    /// `timeout == Duration::ZERO` disables expiry entirely (every
    /// heartbeat'd server is always alive).
    pub fn new(name: impl Into<String>, timeout: Duration) -> Arc<Self> {
        Arc::new(Registry {
            name: name.into(),
            timeout,
            servers: StdMutex::new(HashMap::new()),
        })
    }

    /// The path this registry expects to be mounted at.
    pub fn path(&self) -> String {
        format!("/_{}_/registry", self.name)
    }

    fn servers_header(&self) -> String {
        format!("X-{}-Servers", self.name)
    }

    fn server_header(&self) -> String {
        format!("X-{}-Server", self.name)
    }

    fn put_server(&self, addr: String) {
        let mut servers = self.servers.lock().unwrap();
        servers
            .entry(addr)
            .and_modify(|e| e.last_heartbeat = Instant::now())
            .or_insert_with(|| Entry {
                last_heartbeat: Instant::now(),
            });
    }

    /// `true` iff `timeout == 0` or `now < lastHeartbeat + timeout`.
    fn is_alive(&self, entry: &Entry, now: Instant) -> bool {
        self.timeout.is_zero() || now < entry.last_heartbeat + self.timeout
    }

    /// Sorted set of currently alive addresses. Expired entries are
    /// deleted as a side effect of this call, not on a background timer.
    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let now = Instant::now();
        servers.retain(|_, entry| self.is_alive(entry, now));
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    async fn handle(self: Arc<Self>, req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
        if req.uri().path() != self.path() {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = StatusCode::NOT_FOUND;
            return Ok(resp);
        }

        match *req.method() {
            Method::GET => {
                let csv = self.alive_servers().join(",");
                let mut resp = Response::new(Body::empty());
                let value = HeaderValue::from_str(&csv).unwrap_or_else(|_| HeaderValue::from_static(""));
                if let Ok(name) = hyper::header::HeaderName::from_bytes(self.servers_header().as_bytes()) {
                    resp.headers_mut().insert(name, value);
                }
                Ok(resp)
            }
            Method::POST => {
                let addr = req
                    .headers()
                    .get(self.server_header().as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if addr.is_empty() {
                    let mut resp = Response::new(Body::empty());
                    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    return Ok(resp);
                }
                self.put_server(addr);
                Ok(Response::new(Body::empty()))
            }
            _ => {
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
                Ok(resp)
            }
        }
    }

    /// Serves this registry on an already-bound `listener` until the
    /// process is torn down. Takes ownership of a std listener (rather
    /// than binding a [`SocketAddr`] itself) so callers can read back the
    /// bound address — e.g. after binding to port 0 — before serving.
    pub async fn serve(self: Arc<Self>, listener: std::net::TcpListener) -> Result<()> {
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let registry = self;
        let make_svc = make_service_fn(move |_conn| {
            let registry = registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let registry = registry.clone();
                    async move { registry.handle(req).await }
                }))
            }
        });
        info!(%addr, "registry listening");
        HyperServer::from_tcp(listener)
            .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .serve(make_svc)
            .await
            .map_err(|e| Error::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }
}

/// POSTs one heartbeat to `registry_url`, then every `duration`
/// thereafter (default: the registry's `timeout` minus one minute, the
/// original's `defaultTimeout - time.Minute`). Stops silently the first
/// time a POST fails — the original's "if err != nil, stop sending
/// heart beat" — rather than retrying or backing off.
pub async fn spawn_heartbeat(
    registry_url: String,
    registry_name: String,
    addr: String,
    duration: Option<Duration>,
) -> Result<()> {
    let duration = duration.unwrap_or_else(|| {
        DEFAULT_TIMEOUT.saturating_sub(Duration::from_secs(60))
    });
    send_heartbeat(&registry_url, &registry_name, &addr).await?;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(duration);
        ticker.tick().await; // first tick fires immediately; we already sent once above
        loop {
            ticker.tick().await;
            if let Err(e) = send_heartbeat(&registry_url, &registry_name, &addr).await {
                warn!(error = %e, "heartbeat failed, no longer sending");
                break;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(registry_url: &str, registry_name: &str, addr: &str) -> Result<()> {
    debug!(%addr, registry = %registry_url, "sending heartbeat");
    let client = hyper::Client::new();
    let header_name = format!("X-{registry_name}-Server");
    let req = Request::builder()
        .method(Method::POST)
        .uri(registry_url)
        .header(header_name.as_str(), addr)
        .body(Body::empty())
        .map_err(|e| Error::RegistryUnreachable(e.to_string()))?;
    client
        .request(req)
        .await
        .map_err(|e| Error::RegistryUnreachable(e.to_string()))?;
    Ok(())
}
