//! C6: the service-discovery + load-balancing facade. Owns a
//! [`Discovery`], caches one [`Client`] per endpoint, and layers selection
//! policy, broadcast fan-out, and first-error/first-success semantics on
//! top of the per-endpoint clients' own `call`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::codec::WireCodec;
use crate::discovery::{Discovery, SelectMode};
use crate::error::{Error, Result};
use crate::option::ConnectOption;

/// Owns a [`Discovery`] and a cache of per-endpoint [`Client`]s, selecting
/// one per call and fanning out across all of them for `broadcast`.
pub struct XClient<Cod: WireCodec> {
    discovery: Arc<dyn Discovery>,
    select_mode: SelectMode,
    option: ConnectOption,
    codec: Cod,
    registry_name: String,
    clients: AsyncMutex<HashMap<String, Arc<Client<Cod>>>>,
}

impl<Cod: WireCodec> std::fmt::Debug for XClient<Cod> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XClient")
            .field("select_mode", &self.select_mode)
            .field("registry_name", &self.registry_name)
            .finish()
    }
}

impl<Cod: WireCodec> XClient<Cod> {
    /// `registry_name` is only consulted for `http@`-prefixed endpoints,
    /// where it becomes part of the HTTP-CONNECT path and sentinel status
    /// line (see [`Client::xdial`]).
    pub fn new(
        discovery: Arc<dyn Discovery>,
        select_mode: SelectMode,
        option: ConnectOption,
        codec: Cod,
        registry_name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(XClient {
            discovery,
            select_mode,
            option,
            codec,
            registry_name: registry_name.into(),
            clients: AsyncMutex::new(HashMap::new()),
        })
    }

    /// Returns the cached client for `rpc_addr`, dropping and re-dialing
    /// it first if the cached one is no longer available.
    async fn dial(&self, rpc_addr: &str) -> Result<Arc<Client<Cod>>> {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(rpc_addr) {
            if c.is_available() {
                return Ok(c.clone());
            }
            clients.remove(rpc_addr);
        }
        let client =
            Client::xdial(rpc_addr, &self.registry_name, self.option.clone(), self.codec.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    /// Asks discovery for one endpoint per the configured [`SelectMode`]
    /// and delegates to that endpoint's [`Client::call`].
    pub async fn call<Args, Reply>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: &Args,
    ) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let addr = self.discovery.get(self.select_mode).await?;
        let client = self.dial(&addr).await?;
        client.call(cancel, service_method, args).await
    }

    /// Calls every known endpoint in parallel. The first call to complete
    /// decides the outcome: if it succeeds, its reply is returned and
    /// later arrivals (success or failure) are discarded; if it fails,
    /// that error cancels every other in-flight call (via a child of
    /// `cancel`) and is returned once all calls have finished.
    pub async fn broadcast<Args, Reply>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: Args,
    ) -> Result<Reply>
    where
        Args: Serialize + Send + Sync + 'static,
        Reply: DeserializeOwned + Send + 'static,
    {
        let addrs = self.discovery.get_all().await?;
        if addrs.is_empty() {
            return Err(Error::NoAvailableServers);
        }

        let args = Arc::new(args);
        let method = service_method.to_string();
        let shared_cancel = cancel.child_token();
        // Each task gets its own private reply slot; at most one of them
        // is ever copied into `outcome`, so the caller's result can never
        // be written concurrently by two calls.
        let outcome: Arc<StdMutex<Option<std::result::Result<Reply, Error>>>> =
            Arc::new(StdMutex::new(None));

        let mut tasks = JoinSet::new();
        for addr in addrs {
            let args = args.clone();
            let method = method.clone();
            let cancel = shared_cancel.clone();
            let outcome = outcome.clone();
            let client = self.dial(&addr).await;
            tasks.spawn(async move {
                let result = match client {
                    Ok(client) => client.call::<Args, Reply>(&cancel, &method, args.as_ref()).await,
                    Err(e) => Err(e),
                };
                record(&outcome, &cancel, result);
            });
        }

        while tasks.join_next().await.is_some() {}

        let outcome = Arc::try_unwrap(outcome)
            .unwrap_or_else(|shared| StdMutex::new(shared.lock().unwrap().take()))
            .into_inner()
            .unwrap();
        outcome.unwrap_or(Err(Error::NoAvailableServers))
    }

    /// Closes and drops every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }
}

/// Publishes `result` into `outcome` iff nothing has been published yet,
/// and cancels `cancel` if `result` is an error — the first-error/
/// first-success rule applied at the single point every broadcast task
/// funnels through.
fn record<Reply>(
    outcome: &StdMutex<Option<std::result::Result<Reply, Error>>>,
    cancel: &CancellationToken,
    result: Result<Reply>,
) {
    let mut guard = outcome.lock().unwrap();
    if guard.is_some() {
        return;
    }
    if result.is_err() {
        cancel.cancel();
    }
    *guard = Some(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::error::Error;
    use crate::server::Server;
    use crate::service::ServiceBuilder;
    use serde::Deserialize;
    use std::sync::Arc as StdArc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    struct Calc;

    async fn spawn_calc_server(fail: bool) -> std::net::SocketAddr {
        let server = Server::new(BincodeCodec);
        let calc = StdArc::new(Calc);
        let service = ServiceBuilder::<BincodeCodec>::new("Calc")
            .unwrap()
            .method("Sum", calc.clone(), move |_c, a: SumArgs| async move {
                if fail {
                    Err(Error::Method("boom".into()))
                } else {
                    Ok::<i64, Error>(a.num1 + a.num2)
                }
            })
            .unwrap()
            .method("Sleep", calc, move |_c, millis: u64| async move {
                if fail {
                    return Err(Error::Method("boom".into()));
                }
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<i64, Error>(0)
            })
            .unwrap()
            .build();
        server.register(service).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    fn endpoint(addr: std::net::SocketAddr) -> String {
        format!("tcp@{addr}")
    }

    #[tokio::test]
    async fn call_selects_an_endpoint_and_delegates() {
        let addr = spawn_calc_server(false).await;
        let discovery: Arc<dyn Discovery> =
            Arc::new(crate::discovery::MultiServerDiscovery::new(vec![endpoint(addr)]));
        let xc = XClient::new(discovery, SelectMode::Random, ConnectOption::default(), BincodeCodec, "Xrpc");
        let cancel = CancellationToken::new();
        let reply: i64 = xc
            .call(&cancel, "Calc.Sum", &SumArgs { num1: 2, num2: 3 })
            .await
            .unwrap();
        assert_eq!(reply, 5);
    }

    #[tokio::test]
    async fn broadcast_returns_the_first_success_and_caches_clients() {
        let a = spawn_calc_server(false).await;
        let b = spawn_calc_server(false).await;
        let discovery: Arc<dyn Discovery> = Arc::new(crate::discovery::MultiServerDiscovery::new(vec![
            endpoint(a),
            endpoint(b),
        ]));
        let xc = XClient::new(discovery, SelectMode::Random, ConnectOption::default(), BincodeCodec, "Xrpc");
        let cancel = CancellationToken::new();
        let reply: i64 = xc
            .broadcast(&cancel, "Calc.Sum", SumArgs { num1: 2, num2: 3 })
            .await
            .unwrap();
        assert_eq!(reply, 5);
        xc.close().await;
    }

    #[tokio::test]
    async fn broadcast_surfaces_the_first_error_and_cancels_the_rest() {
        let failing = spawn_calc_server(true).await;
        let slow = spawn_calc_server(false).await;
        let discovery: Arc<dyn Discovery> = Arc::new(crate::discovery::MultiServerDiscovery::new(vec![
            endpoint(failing),
            endpoint(slow),
        ]));
        let xc = XClient::new(discovery, SelectMode::Random, ConnectOption::default(), BincodeCodec, "Xrpc");
        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let result: Result<i64> = xc.broadcast(&cancel, "Calc.Sleep", 5000u64).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
