//! C5: endpoint discovery feeding the X-Client's selection policy.
//!
//! Two implementations: [`MultiServerDiscovery`] holds a fixed, caller-set
//! list (`Update` is the only way it changes); [`RegistryDiscovery`] wraps
//! one and keeps it current by polling an [`crate::registry`] server on a
//! TTL, the way the original tutorial's `RegistryDiscovery` embeds a
//! `MultiServersDiscovery` by struct embedding. Rust has no embedding, so
//! `RegistryDiscovery` holds one and forwards `get`/`get_all` through its
//! own `refresh` first.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use hyper::Uri;
use rand::Rng;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// `defaultUpdateTimeout` from the original's `discovery_rpc.go`.
const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(10);

/// Selection policy passed to [`Discovery::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Pick uniformly at random among the current endpoints.
    Random,
    /// Advance a counter (initialized to a random offset) modulo the
    /// endpoint count, so synchronized clients don't all hammer index 0.
    RoundRobin,
}

/// A source of RPC endpoints for the X-Client to select from.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Pulls a fresh endpoint list from whatever backs this discovery, if
    /// the implementation has one. A no-op for a purely static list.
    async fn refresh(&self) -> Result<()>;
    /// Replaces the endpoint list directly.
    async fn update(&self, servers: Vec<String>);
    /// Selects one endpoint per `mode`.
    async fn get(&self, mode: SelectMode) -> Result<String>;
    /// Returns a defensive copy of every known endpoint.
    async fn get_all(&self) -> Result<Vec<String>>;
}

struct State {
    servers: Vec<String>,
    index: usize,
}

/// A fixed, directly managed list of endpoints.
pub struct MultiServerDiscovery {
    state: StdMutex<State>,
}

impl std::fmt::Debug for MultiServerDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MultiServerDiscovery")
            .field("servers", &state.servers)
            .finish()
    }
}

impl MultiServerDiscovery {
    /// Starts `round_robin`'s counter at a random offset into `servers`,
    /// matching the original's `d.r.Intn(math.MaxInt32 - 1)` — the point
    /// is only to avoid every freshly constructed client starting at the
    /// same index, not cryptographic unpredictability.
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..i32::MAX as usize);
        MultiServerDiscovery {
            state: StdMutex::new(State { servers, index }),
        }
    }
}

#[async_trait]
impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.state.lock().unwrap().servers = servers;
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = rand::thread_rng().gen_range(0..n);
                Ok(state.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                // `servers` can be updated concurrently, so the index is
                // taken modulo the *current* length rather than trusted
                // to still be in range.
                let i = state.index % n;
                state.index = (state.index + 1) % n;
                Ok(state.servers[i].clone())
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().servers.clone())
    }
}

/// Polls a [`crate::registry`] HTTP endpoint for the current alive-server
/// list, refreshing at most once per `refresh_ttl`.
pub struct RegistryDiscovery {
    inner: MultiServerDiscovery,
    registry_url: String,
    registry_name: String,
    refresh_ttl: Duration,
    last_refresh: StdMutex<Option<Instant>>,
    http: hyper::Client<hyper::client::HttpConnector>,
}

impl std::fmt::Debug for RegistryDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryDiscovery")
            .field("registry_url", &self.registry_url)
            .field("registry_name", &self.registry_name)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

impl RegistryDiscovery {
    /// `registry_url` is the full GET URL (e.g.
    /// `http://localhost:9999/_Xrpc_/registry`); `registry_name` must
    /// match the name the registry was constructed with, since it
    /// determines the `X-<Name>-Servers` header both sides read.
    /// `refresh_ttl` defaults to 10 seconds when `None`.
    pub fn new(
        registry_url: impl Into<String>,
        registry_name: impl Into<String>,
        refresh_ttl: Option<Duration>,
    ) -> Self {
        RegistryDiscovery {
            inner: MultiServerDiscovery::new(Vec::new()),
            registry_url: registry_url.into(),
            registry_name: registry_name.into(),
            refresh_ttl: refresh_ttl.unwrap_or(DEFAULT_REFRESH_TTL),
            last_refresh: StdMutex::new(None),
            http: hyper::Client::new(),
        }
    }

    fn header_name(&self) -> String {
        format!("X-{}-Servers", self.registry_name)
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        {
            let last = *self.last_refresh.lock().unwrap();
            if let Some(t) = last {
                if Instant::now() < t + self.refresh_ttl {
                    return Ok(());
                }
            }
        }

        debug!(registry = %self.registry_url, "refreshing servers from registry");
        let uri: Uri = self
            .registry_url
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| Error::RegistryUnreachable(e.to_string()))?;
        let resp = self
            .http
            .get(uri)
            .await
            .map_err(|e| Error::RegistryUnreachable(e.to_string()))?;

        let raw = resp
            .headers()
            .get(self.header_name().as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        self.inner.update(servers).await;
        *self.last_refresh.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) {
        self.inner.update(servers).await;
        *self.last_refresh.lock().unwrap() = Some(Instant::now());
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_visits_every_endpoint_twice_in_2n_draws() {
        let d = MultiServerDiscovery::new(vec!["a".into(), "b".into(), "c".into()]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..6 {
            let s = d.get(SelectMode::RoundRobin).await.unwrap();
            *counts.entry(s).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 2));
    }

    #[tokio::test]
    async fn empty_list_is_no_available_servers() {
        let d = MultiServerDiscovery::new(Vec::new());
        assert!(matches!(d.get(SelectMode::Random).await, Err(Error::NoAvailableServers)));
    }

    #[tokio::test]
    async fn update_replaces_the_list() {
        let d = MultiServerDiscovery::new(vec!["a".into()]);
        d.update(vec!["x".into(), "y".into()]).await;
        let all = d.get_all().await.unwrap();
        assert_eq!(all, vec!["x".to_string(), "y".to_string()]);
    }
}
