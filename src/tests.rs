use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::SinkExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::client::Client;
use crate::config::{ClientConfig, ServerConfig};
use crate::protocol::{ClientSettings, DESTINATION_HEADER, SECRET_HEADER};
use crate::rules::RuleConfig;
use crate::server::Server;

// -- Test helpers --

/// Spawns a local HTTP origin with a few fixed routes.
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(origin_handler))
                    .await;
            });
        }
    });
    addr
}

async fn origin_handler(req: Request<Incoming>) -> anyhow::Result<Response<Full<Bytes>>> {
    match req.uri().path() {
        "/hello" => Ok(Response::new(Full::new(Bytes::from("hello world\n")))),
        "/echo" => {
            let method = req.method().to_string();
            let path = req.uri().path().to_string();
            let probe = req
                .headers()
                .get("x-probe")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = req.into_body().collect().await?.to_bytes();
            let text = format!("{method} {path} {probe} {}", String::from_utf8_lossy(&body));
            Ok(Response::builder()
                .header("x-origin", "echo")
                .body(Full::new(Bytes::from(text)))
                .unwrap())
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(Response::new(Full::new(Bytes::from("slow\n"))))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap()),
    }
}

fn server_config(timeout_ms: u64, idle_timeout_ms: u64) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        timeout_ms,
        idle_timeout_ms,
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
    let server = Server::new(config).unwrap();
    let addr = server.bind().await.unwrap();
    (server, addr)
}

fn client_config(server: SocketAddr, idle: usize, max: usize) -> ClientConfig {
    ClientConfig {
        id: uuid::Uuid::new_v4().to_string(),
        name: "test-endpoint".to_string(),
        targets: vec![format!("ws://{server}/register")],
        pool_idle_size: idle,
        pool_max_size: max,
        ..Default::default()
    }
}

/// Polls a condition for up to five seconds.
async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A TCP port with nothing listening on it.
async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn http() -> reqwest::Client {
    reqwest::Client::new()
}

// -- End-to-end scenarios --

#[tokio::test]
async fn proxies_a_simple_get() {
    let origin = spawn_origin().await;
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 2, 10);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnels", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 2)
    })
    .await;

    let response = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, format!("http://{origin}/hello"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "hello world\n");

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn request_round_trip_is_faithful() {
    let origin = spawn_origin().await;
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 1, 10);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnels", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 1)
    })
    .await;

    let response = http()
        .post(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, format!("http://{origin}/echo"))
        .header("x-probe", "fidelity")
        .body("ping body")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers().get("x-origin").unwrap(), "echo");
    assert_eq!(
        response.text().await.unwrap(),
        "POST /echo fidelity ping body"
    );

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn missing_destination_header_is_a_proxy_error() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;

    let response = http()
        .get(format!("http://{addr}/request"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);

    server.shutdown();
}

#[tokio::test]
async fn acquire_times_out_without_tunnels() {
    let (server, addr) = start_server(server_config(200, 60_000)).await;

    let started = Instant::now();
    let response = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, "http://nowhere/x")
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status().as_u16(), 526);
    assert!(
        elapsed >= Duration::from_millis(150) && elapsed < Duration::from_millis(1000),
        "timed out after {elapsed:?}"
    );

    server.shutdown();
}

#[tokio::test]
async fn blacklisted_destination_never_crosses_the_tunnel() {
    let mut config = server_config(1000, 60_000);
    config.blacklist = vec![RuleConfig {
        url: Some("^http://deny/".to_string()),
        ..Default::default()
    }];
    let (server, addr) = start_server(config).await;

    let response = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, "http://deny/x")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 526);
    assert!(response.text().await.unwrap().contains("forbidden"));

    server.shutdown();
}

#[tokio::test]
async fn unreachable_target_is_reported_by_the_endpoint() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 1, 10);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnels", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 1)
    })
    .await;

    let refused = unused_port().await;
    let response = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, format!("http://127.0.0.1:{refused}/x"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 527);
    assert!(!response.text().await.unwrap().is_empty());

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn endpoint_validator_rejects_with_remote_error() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let mut config = client_config(addr, 1, 10);
    config.blacklist = vec![RuleConfig {
        url: Some("^http://forbidden-target/".to_string()),
        ..Default::default()
    }];
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnels", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 1)
    })
    .await;

    let response = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, "http://forbidden-target/x")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 527);
    assert!(response.text().await.unwrap().contains("forbidden"));

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn one_request_holds_one_tunnel() {
    let origin = spawn_origin().await;
    let (server, addr) = start_server(server_config(150, 60_000)).await;
    let config = client_config(addr, 1, 1);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnel", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 1)
    })
    .await;

    let slow = format!("http://{origin}/slow");
    let first = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, &slow)
        .send();
    let second = http()
        .get(format!("http://{addr}/request"))
        .header(DESTINATION_HEADER, &slow)
        .send();

    let (first, second) = tokio::join!(first, second);
    let mut statuses = [
        first.unwrap().status().as_u16(),
        second.unwrap().status().as_u16(),
    ];
    statuses.sort_unstable();

    // Exactly one request won the only tunnel; the other timed out.
    assert_eq!(statuses, [200, 526]);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn surplus_idle_tunnels_are_reaped() {
    let (server, addr) = start_server(server_config(1000, 200)).await;

    // One identity advertising a pool size of 1, registering 5 tunnels.
    let mut sockets = Vec::new();
    for connection_id in 0..5u64 {
        let settings = ClientSettings {
            id: "reap-test".to_string(),
            name: "raw".to_string(),
            pool_size: 1,
            connection_id,
        };
        let request = format!("ws://{addr}/register")
            .into_client_request()
            .unwrap();
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws.send(Message::text(settings.to_json().unwrap()))
            .await
            .unwrap();
        sockets.push(ws);
    }

    wait_for("all tunnels registered", || {
        server
            .pool("reap-test")
            .is_some_and(|pool| pool.size().idle == 5)
    })
    .await;

    wait_for("surplus tunnels reaped", || {
        server
            .pool("reap-test")
            .is_some_and(|pool| pool.size().idle == 1)
    })
    .await;

    server.shutdown();
}

#[tokio::test]
async fn register_requires_the_shared_secret() {
    let mut config = server_config(1000, 60_000);
    config.secret_key = "hunter2".to_string();
    let (server, addr) = start_server(config).await;

    // Without the secret the upgrade is refused.
    let request = format!("ws://{addr}/register")
        .into_client_request()
        .unwrap();
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    // With it, the handshake completes.
    let mut request = format!("ws://{addr}/register")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(SECRET_HEADER, "hunter2".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());

    server.shutdown();
}

#[tokio::test]
async fn status_endpoint_answers_ok() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;

    let response = http()
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    server.shutdown();
}

// -- Pool invariants --

#[tokio::test]
async fn endpoint_pool_respects_the_hard_cap() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 5, 3);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("pool to settle", || {
        client.pools()[0].size().idle == 3
    })
    .await;

    let size = client.pools()[0].size();
    assert_eq!(size.total, 3, "cap exceeded: {size}");
    assert!(server.pool(&id).is_some());

    // Settled: no further growth on the next replenish cycles.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(client.pools()[0].size().total, 3);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn endpoint_pool_reaches_its_idle_target() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 4, 10);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle target", || client.pools()[0].size().idle >= 4).await;
    wait_for("server sees them", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 4)
    })
    .await;

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn closing_the_endpoint_empties_the_server_pool() {
    let (server, addr) = start_server(server_config(1000, 60_000)).await;
    let config = client_config(addr, 2, 10);
    let id = config.id.clone();
    let client = Client::start(config).unwrap();

    wait_for("idle tunnels", || {
        server.pool(&id).is_some_and(|pool| pool.size().idle >= 2)
    })
    .await;

    client.shutdown();

    // The pool closes itself once its member set empties and is removed
    // from the server.
    wait_for("pool removal", || server.pool(&id).is_none()).await;

    server.shutdown();
}
