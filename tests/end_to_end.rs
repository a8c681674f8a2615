//! End-to-end scenarios exercised over real loopback TCP sockets rather
//! than a mocked transport.

#![cfg(all(feature = "client", feature = "server"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use xrpc::client::Client;
use xrpc::codec::BincodeCodec;
use xrpc::error::Error;
use xrpc::option::ConnectOption;
use xrpc::server::Server;
use xrpc::service::ServiceBuilder;

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Calc;

async fn start_calc_server(handle_timeout: Duration) -> SocketAddr {
    let server = Server::new(BincodeCodec);
    let calc = Arc::new(Calc);
    let service = ServiceBuilder::<BincodeCodec>::new("Calc")
        .unwrap()
        .method("Sum", calc.clone(), |_c, a: Args| async move {
            Ok::<i64, Error>(a.num1 + a.num2)
        })
        .unwrap()
        .method("Sleep", calc, |_c, a: Args| async move {
            tokio::time::sleep(Duration::from_secs(a.num1 as u64)).await;
            Ok::<i64, Error>(a.num1 + a.num2)
        })
        .unwrap()
        .build();
    server.register(service).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let _ = handle_timeout;
    addr
}

async fn dial(addr: SocketAddr, handle_timeout: Duration) -> Arc<Client<BincodeCodec>> {
    let opt = ConnectOption {
        handle_timeout,
        ..ConnectOption::default()
    };
    Client::dial(&addr.to_string(), opt, BincodeCodec).await.unwrap()
}

#[tokio::test]
async fn scenario_1_basic_call() {
    let addr = start_calc_server(Duration::ZERO).await;
    let client = dial(addr, Duration::ZERO).await;
    let cancel = CancellationToken::new();
    let reply: i64 = client
        .call(&cancel, "Calc.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
}

#[tokio::test]
async fn scenario_2_unknown_method_then_a_working_call() {
    let addr = start_calc_server(Duration::ZERO).await;
    let client = dial(addr, Duration::ZERO).await;
    let cancel = CancellationToken::new();

    let err = client
        .call::<Args, i64>(&cancel, "Calc.Mul", &Args { num1: 2, num2: 3 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find method"));

    let reply: i64 = client
        .call(&cancel, "Calc.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
}

#[tokio::test]
async fn scenario_3_handle_timeout_then_a_working_call() {
    // The server's option.handle_timeout is negotiated per-connection
    // (the client sends it in the handshake frame), so setting it on the
    // client's `ConnectOption` is what the server actually enforces.
    let addr = start_calc_server(Duration::ZERO).await;
    let client = dial(addr, Duration::from_secs(1)).await;
    let cancel = CancellationToken::new();

    let start = tokio::time::Instant::now();
    let err = client
        .call::<Args, i64>(&cancel, "Calc.Sleep", &Args { num1: 3, num2: 0 })
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("request handle timeout"));
    assert!(start.elapsed() < Duration::from_secs(3));

    let reply: i64 = client
        .call(&cancel, "Calc.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
}

#[tokio::test]
async fn scenario_4_client_cancellation_returns_well_before_the_sleep_finishes() {
    let addr = start_calc_server(Duration::ZERO).await;
    let client = dial(addr, Duration::ZERO).await;
    let cancel = CancellationToken::new();
    let cancel2 = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel2.cancel();
    });

    let start = tokio::time::Instant::now();
    let err = client
        .call::<Args, i64>(&cancel, "Calc.Sleep", &Args { num1: 5, num2: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[cfg(feature = "discovery")]
#[tokio::test]
async fn scenario_5_broadcast_first_error_cancels_the_other_peer() {
    use xrpc::discovery::{Discovery, MultiServerDiscovery, SelectMode};
    use xrpc::xclient::XClient;

    let ok_addr = start_calc_server(Duration::ZERO).await;

    let failing_server = Server::new(BincodeCodec);
    let calc = Arc::new(Calc);
    let service = ServiceBuilder::<BincodeCodec>::new("Calc")
        .unwrap()
        .method("Sum", calc, |_c, _a: Args| async move {
            Err::<i64, Error>(Error::Method("deliberate failure".into()))
        })
        .unwrap()
        .build();
    failing_server.register(service).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let failing_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = failing_server.serve(listener).await;
    });

    let discovery: Arc<dyn Discovery> = Arc::new(MultiServerDiscovery::new(vec![
        format!("tcp@{ok_addr}"),
        format!("tcp@{failing_addr}"),
    ]));
    let xc = XClient::new(discovery, SelectMode::Random, ConnectOption::default(), BincodeCodec, "Xrpc");
    let cancel = CancellationToken::new();
    let result: Result<i64, Error> = xc
        .broadcast(&cancel, "Calc.Sum", Args { num1: 2, num2: 3 })
        .await;
    assert!(result.is_err());

    // The X-Client is still usable afterward.
    let reply: i64 = xc
        .call(&cancel, "Calc.Sum", &Args { num1: 2, num2: 3 })
        .await
        .unwrap();
    assert_eq!(reply, 5);
    xc.close().await;
}

#[cfg(all(feature = "discovery", feature = "registry"))]
#[tokio::test]
async fn scenario_6_registry_liveness_tracks_heartbeats() {
    use xrpc::discovery::{Discovery, RegistryDiscovery};
    use xrpc::registry::Registry;

    let registry = Registry::new("Xrpc", Duration::from_millis(600));
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let registry_addr = listener.local_addr().unwrap();
    let reg = registry.clone();
    tokio::spawn(async move {
        let _ = reg.serve(listener).await;
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    let registry_url = format!("http://{registry_addr}{}", registry.path());

    let server_a = start_calc_server(Duration::ZERO).await;
    let server_b = start_calc_server(Duration::ZERO).await;

    xrpc::registry::spawn_heartbeat(
        registry_url.clone(),
        "Xrpc".to_string(),
        format!("tcp@{server_a}"),
        Some(Duration::from_millis(150)),
    )
    .await
    .unwrap();
    xrpc::registry::spawn_heartbeat(
        registry_url.clone(),
        "Xrpc".to_string(),
        format!("tcp@{server_b}"),
        Some(Duration::from_millis(150)),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let discovery = RegistryDiscovery::new(registry_url, "Xrpc", Some(Duration::ZERO));
    let mut servers = discovery.get_all().await.unwrap();
    servers.sort();
    let mut expected = vec![format!("tcp@{server_a}"), format!("tcp@{server_b}")];
    expected.sort();
    assert_eq!(servers, expected);
}
