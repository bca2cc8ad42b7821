//! Public rendezvous peer: accepts WebSocket registrations from internal
//! peers, pools them as idle tunnels, and forwards inbound HTTP requests
//! through them.

pub mod pool;
pub mod stack;
pub mod tunnel;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::protocol::{ClientSettings, DESTINATION_HEADER, PROXY_ERROR_STATUS, SECRET_HEADER};
use crate::rules::Validator;
use crate::server::pool::Pool;
use crate::server::stack::Closed;
use crate::server::tunnel::{ServerStream, Tunnel};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Log the failure and answer it with a proxy-layer 526.
fn proxy_error(message: &str) -> Response<BoxBody> {
    warn!("{message}");
    Response::builder()
        .status(StatusCode::from_u16(PROXY_ERROR_STATUS).unwrap())
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full_body(format!("{message}\n")))
        .unwrap()
}

/// The public peer. One pool per registered internal-peer identity.
pub struct Server {
    config: ServerConfig,
    validator: Validator,
    pools: parking_lot::RwLock<HashMap<String, Arc<Pool>>>,
    done: CancellationToken,
}

impl Server {
    /// A rule that fails to compile refuses the whole configuration.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let validator = Validator::new(&config.blacklist, &config.whitelist)
            .context("unable to initialize the request validator")?;

        Ok(Arc::new(Self {
            config,
            validator,
            pools: parking_lot::RwLock::new(HashMap::new()),
            done: CancellationToken::new(),
        }))
    }

    /// Bind the listener and start serving in the background. Returns the
    /// bound address so an ephemeral port can be discovered.
    pub async fn bind(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.addr())
            .await
            .with_context(|| format!("unable to bind {}", self.config.addr()))?;
        let addr = listener.local_addr()?;

        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().stats_loop());

        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.done.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, _)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let server = server.clone();
                            async move { server.handle(req).await }
                        });

                        if let Err(err) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await
                        {
                            debug!("connection error: {err}");
                        }
                    });
                }
                Err(err) => error!("failed to accept connection: {err}"),
            }
        }
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody>> {
        match (req.method(), req.uri().path()) {
            (_, "/request") => self.request(req).await,
            (&Method::GET, "/register") => self.register(req).await,
            (&Method::GET, "/status") => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(full_body("ok"))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(full_body("Not Found"))
                .unwrap()),
        }
    }

    /// Forward one inbound HTTP request through an idle tunnel.
    async fn request(
        self: &Arc<Self>,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody>> {
        let destination = match req
            .headers()
            .get(DESTINATION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) => value,
            None => return Ok(proxy_error("missing X-PROXY-DESTINATION header")),
        };
        let destination = match Url::parse(destination) {
            Ok(url) => url,
            Err(_) => return Ok(proxy_error("unable to parse X-PROXY-DESTINATION header")),
        };

        info!("[{}] {}", req.method(), destination);

        if let Err(err) =
            self.validator
                .validate(req.method().as_str(), destination.as_str(), req.headers())
        {
            return Ok(proxy_error(&format!("invalid request: {err}")));
        }

        let Some(tunnel) = self.acquire_tunnel().await else {
            return Ok(proxy_error("unable to get a proxy connection"));
        };

        match tunnel.proxy_request(req, &destination).await {
            Ok(response) => Ok(response),
            Err(err) => {
                // Throw the tunnel away; it is out of frame sync.
                tunnel.close();
                Ok(proxy_error(&format!("unable to proxy request: {err}")))
            }
        }
    }

    /// Acquire an idle tunnel across all pools, bounded by the configured
    /// timeout. Without a timeout this degrades to a single non-blocking
    /// pass, plus a 10 ms retry loop while no pool exists at all.
    async fn acquire_tunnel(&self) -> Option<Arc<Tunnel>> {
        let deadline = (self.config.timeout_ms > 0).then(|| {
            tokio::time::Instant::now() + Duration::from_millis(self.config.timeout_ms)
        });

        loop {
            if self.done.is_cancelled() {
                return None;
            }

            let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();

            if pools.is_empty() {
                if let Some(deadline) = deadline {
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            match deadline {
                None => {
                    let mut contended = false;
                    for pool in &pools {
                        if let Some(tunnel) = pool.idle_stack().try_acquire().await {
                            if tunnel.take() {
                                return Some(tunnel);
                            }
                            contended = true;
                        }
                    }
                    if !contended {
                        return None;
                    }
                    // Lost a race; scan again.
                }
                Some(deadline) => {
                    let stacks: Vec<_> = pools.iter().map(|p| p.idle_stack()).collect();
                    let mut offers: FuturesUnordered<_> =
                        stacks.iter().map(|stack| stack.acquire()).collect();

                    let outcome = tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => return None,
                        offer = offers.next() => offer,
                    };
                    drop(offers);

                    match outcome {
                        Some(Ok(tunnel)) => {
                            if tunnel.take() {
                                return Some(tunnel);
                            }
                            // Closed between offer and take; try again.
                        }
                        // A pool went away, or every stack closed. Re-snapshot.
                        Some(Err(Closed)) | None => {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }
    }

    /// Upgrade a registration request and hand the WebSocket to the pool
    /// named by its greeting.
    async fn register(
        self: &Arc<Self>,
        mut req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody>> {
        if !self.config.secret_key.is_empty() {
            let provided = req
                .headers()
                .get(SECRET_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if provided != self.config.secret_key {
                return Ok(proxy_error("invalid X-SECRET-KEY"));
            }
        }

        let is_websocket = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !is_websocket {
            return Ok(proxy_error("http upgrade error: not a websocket upgrade"));
        }
        let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
            return Ok(proxy_error("http upgrade error: missing Sec-WebSocket-Key"));
        };
        let accept_key = derive_accept_key(key.as_bytes());

        let on_upgrade = hyper::upgrade::on(&mut req);
        let server = self.clone();
        tokio::spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws = WebSocketStream::from_raw_socket(
                        TokioIo::new(upgraded),
                        Role::Server,
                        None,
                    )
                    .await;
                    if let Err(err) = server.accept_tunnel(ws).await {
                        warn!("tunnel registration failed: {err}");
                    }
                }
                Err(err) => warn!("http upgrade error: {err}"),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, HeaderValue::from_static("Upgrade"))
            .header(UPGRADE, HeaderValue::from_static("websocket"))
            .header(SEC_WEBSOCKET_ACCEPT, accept_key)
            .body(full_body(Bytes::new()))
            .unwrap())
    }

    /// Read the greeting and register the tunnel with its pool, creating
    /// the pool on first sight of this peer identity.
    async fn accept_tunnel(self: Arc<Self>, mut ws: ServerStream) -> Result<()> {
        let settings = match ws.next().await {
            Some(Ok(Message::Text(greeting))) => ClientSettings::from_json(greeting.as_bytes())?,
            Some(Ok(_)) => anyhow::bail!("greeting must be a text frame"),
            Some(Err(err)) => return Err(err).context("unable to read client settings"),
            None => anyhow::bail!("connection closed before greeting"),
        };

        let pool = {
            let mut pools = self.pools.write();
            match pools.get(&settings.id) {
                Some(pool) if !pool.is_closed() => pool.clone(),
                _ => {
                    let pool = Pool::new(
                        settings.clone(),
                        Duration::from_millis(self.config.idle_timeout_ms),
                    );
                    pools.insert(settings.id.clone(), pool.clone());

                    // Delete the pool from the map once it closes itself.
                    let server = self.clone();
                    let watched = pool.clone();
                    let id = settings.id.clone();
                    let name = settings.name.clone();
                    tokio::spawn(async move {
                        watched.closed().await;
                        let mut pools = server.pools.write();
                        if let Some(current) = pools.get(&id) {
                            if Arc::ptr_eq(current, &watched) {
                                pools.remove(&id);
                                info!("removing empty connection pool: {name} ({id})");
                            }
                        }
                    });

                    pool
                }
            }
        };

        pool.register(settings.connection_id, ws);
        Ok(())
    }

    async fn stats_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
            let (mut idle, mut busy) = (0, 0);
            for pool in &pools {
                let size = pool.size();
                idle += size.idle;
                busy += size.busy;
            }
            info!("{} pools, {idle} idle, {busy} busy", pools.len());
        }
    }

    /// Snapshot of one peer's pool, if registered.
    pub fn pool(&self, id: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(id).cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Stop accepting and close every pool, which closes every tunnel.
    pub fn shutdown(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();

        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.close();
        }
    }
}
