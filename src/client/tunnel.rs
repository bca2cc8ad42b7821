use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::protocol::{
    headers_from_map, headers_to_map, ClientSettings, RequestFrame, ResponseFrame, SECRET_HEADER,
};
use crate::rules::Validator;
use crate::tunnel::{Status, StatusNotifier};

/// WebSocket dialed out to a rendezvous peer.
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type Sink = Arc<Mutex<SplitSink<ClientStream, Message>>>;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// One outbound tunnel to a rendezvous peer.
///
/// Dials, greets, then sits idle waiting for forwarded requests, executing
/// each against its target URL and streaming the response back. Every
/// status change fires the pool's edge signal so the replenisher
/// reconsiders.
pub struct Tunnel {
    settings: ClientSettings,
    target: String,
    state: parking_lot::Mutex<Status>,
    events: StatusNotifier,
    done: CancellationToken,
}

impl Tunnel {
    pub fn new(settings: ClientSettings, target: String, events: StatusNotifier) -> Arc<Self> {
        Arc::new(Self {
            settings,
            target,
            state: parking_lot::Mutex::new(Status::Connecting),
            events,
            done: CancellationToken::new(),
        })
    }

    pub fn status(&self) -> Status {
        *self.state.lock()
    }

    fn set_status(&self, status: Status) {
        {
            let mut state = self.state.lock();
            if *state == status || *state == Status::Closed {
                return;
            }
            *state = status;
        }
        self.events.notify();
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == Status::Closed {
                return;
            }
            *state = Status::Closed;
        }
        self.done.cancel();
        self.events.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Dial the rendezvous and send the greeting.
    pub async fn connect(&self, config: &ClientConfig) -> Result<ClientStream> {
        debug!("connecting to {}", self.target);

        let mut request = self
            .target
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid target url {}", self.target))?;
        request.headers_mut().insert(
            SECRET_HEADER,
            HeaderValue::from_str(&config.secret_key).context("invalid secret key")?,
        );

        let connector = if config.insecure_skip_verify {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .build()
                .context("unable to build tls connector")?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (mut ws, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .with_context(|| format!("unable to connect to {}", self.target))?;

        let greeting = self.settings.to_json()?;
        ws.send(Message::text(greeting))
            .await
            .context("unable to send greeting")?;

        debug!("connected to {}", self.target);

        Ok(ws)
    }

    /// Serve forwarded requests until the tunnel dies. Holds the single
    /// reader; a keepalive task pings every five seconds and any ping
    /// failure tears the tunnel down.
    pub async fn serve(
        self: &Arc<Self>,
        ws: ClientStream,
        executor: &reqwest::Client,
        validator: &Validator,
    ) -> Result<()> {
        let (sink, mut stream) = ws.split();
        let sink: Sink = Arc::new(Mutex::new(sink));

        tokio::spawn(keepalive_loop(sink.clone(), self.clone()));

        let result = self.serve_loop(&sink, &mut stream, executor, validator).await;

        self.close();
        let _ = sink.lock().await.close().await;

        result
    }

    async fn serve_loop(
        self: &Arc<Self>,
        sink: &Sink,
        stream: &mut SplitStream<ClientStream>,
        executor: &reqwest::Client,
        validator: &Validator,
    ) -> Result<()> {
        loop {
            self.set_status(Status::Idle);

            // Wait for the serialized request header.
            let header = match self.next_message(stream).await? {
                Some(Message::Text(text)) => text,
                Some(_) => bail!("expected serialized request, got a binary frame"),
                None => return Ok(()),
            };

            self.set_status(Status::Busy);

            let frame: RequestFrame = serde_json::from_str(&header)
                .context("unable to deserialize serialized request")?;

            // The request body always follows as one binary frame.
            let body = match self.next_message(stream).await? {
                Some(Message::Binary(body)) => body,
                Some(_) => bail!("expected request body, got a text frame"),
                None => bail!("connection closed before request body"),
            };

            info!("[{}] {}", frame.method, frame.url);

            match self.execute(&frame, body, executor, validator).await {
                Ok((response, body)) => {
                    let json = serde_json::to_string(&response)
                        .context("unable to serialize response")?;
                    let mut sink = sink.lock().await;
                    sink.send(Message::text(json))
                        .await
                        .context("unable to write response")?;
                    sink.send(Message::binary(body))
                        .await
                        .context("unable to pipe response body")?;
                }
                Err(message) => {
                    // The request could not be executed; report it through
                    // the tunnel and keep serving.
                    warn!("{message}");
                    let response = ResponseFrame::error(&message);
                    let json = serde_json::to_string(&response)
                        .context("unable to serialize response")?;
                    let mut sink = sink.lock().await;
                    sink.send(Message::text(json))
                        .await
                        .context("unable to write response")?;
                    sink.send(Message::binary(message.into_bytes()))
                        .await
                        .context("unable to write response body")?;
                }
            }
        }
    }

    /// Next data frame, skipping control frames. `None` means the peer
    /// closed the tunnel.
    async fn next_message(&self, stream: &mut SplitStream<ClientStream>) -> Result<Option<Message>> {
        loop {
            let msg = tokio::select! {
                _ = self.done.cancelled() => return Ok(None),
                msg = stream.next() => msg,
            };
            match msg {
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return Ok(Some(msg)),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err).context("unable to read request"),
            }
        }
    }

    /// Execute one forwarded request against its target. Any failure is
    /// reported as a human-readable string that becomes the 527 body.
    async fn execute(
        &self,
        frame: &RequestFrame,
        body: Vec<u8>,
        executor: &reqwest::Client,
        validator: &Validator,
    ) -> Result<(ResponseFrame, bytes::Bytes), String> {
        let mut headers = headers_from_map(&frame.header);

        validator
            .validate(&frame.method, &frame.url, &headers)
            .map_err(|err| format!("invalid request: {err}"))?;

        let method = reqwest::Method::from_bytes(frame.method.as_bytes())
            .map_err(|_| format!("invalid request method: {}", frame.method))?;
        let url = reqwest::Url::parse(&frame.url)
            .map_err(|err| format!("invalid request url {}: {err}", frame.url))?;

        // Recomputed by the executing client.
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let response = executor
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| format!("unable to execute request: {err}"))?;

        let frame = ResponseFrame {
            status_code: response.status().as_u16(),
            header: headers_to_map(response.headers()),
            content_length: response
                .content_length()
                .map(|len| len as i64)
                .unwrap_or(-1),
        };
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("unable to read response body: {err}"))?;

        Ok((frame, body))
    }
}

async fn keepalive_loop(sink: Sink, tunnel: Arc<Tunnel>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tunnel.done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let ping = sink.lock().await.send(Message::Ping(Vec::new())).await;
        if ping.is_err() {
            debug!("keepalive failed, closing connection {}", tunnel.settings.connection_id);
            tunnel.close();
            return;
        }
    }
}
