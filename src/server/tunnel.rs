use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::protocol::{headers_from_map, headers_to_map, RequestFrame, ResponseFrame};
use crate::server::stack::IdleStack;
use crate::server::{full_body, BoxBody};
use crate::tunnel::Status;

/// WebSocket accepted from an internal peer on `/register`.
pub type ServerStream = WebSocketStream<TokioIo<Upgraded>>;

struct State {
    status: Status,
    idle_since: Instant,
}

/// One registered tunnel on the public peer.
///
/// Proxies at most one inbound HTTP request at a time. The dispatcher
/// flips it IDLE to BUSY with [`Tunnel::take`]; a completed exchange
/// releases it back to its pool's idle stack.
pub struct Tunnel {
    id: u64,
    state: parking_lot::Mutex<State>,
    sink: tokio::sync::Mutex<SplitSink<ServerStream, Message>>,
    /// Frames handed over by the reader task, one at a time.
    frames: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    releaser: IdleStack<Arc<Tunnel>>,
    done: CancellationToken,
}

impl Tunnel {
    /// Wrap an accepted WebSocket and start its reader task. The tunnel
    /// is immediately IDLE.
    pub fn spawn(id: u64, ws: ServerStream, releaser: IdleStack<Arc<Tunnel>>) -> Arc<Self> {
        let (sink, stream) = ws.split();
        let (handoff, frames) = mpsc::channel(1);

        let tunnel = Arc::new(Self {
            id,
            state: parking_lot::Mutex::new(State {
                status: Status::Idle,
                idle_since: Instant::now(),
            }),
            sink: tokio::sync::Mutex::new(sink),
            frames: tokio::sync::Mutex::new(frames),
            releaser,
            done: CancellationToken::new(),
        });

        tokio::spawn(tunnel.clone().read_loop(stream, handoff));

        tunnel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> (Status, Instant) {
        let state = self.state.lock();
        (state.status, state.idle_since)
    }

    /// Claim the tunnel for one request. Fails if it is not currently
    /// IDLE: someone else took it, or it just closed.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != Status::Idle {
            return false;
        }
        state.status = Status::Busy;
        true
    }

    /// Put the tunnel back into rotation after a completed exchange.
    fn release(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Idle;
            state.idle_since = Instant::now();
        }
        self.releaser.offer(self.clone());
    }

    /// Close the tunnel. Terminal; the reader task sends the close frame.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.status == Status::Closed {
                return;
            }
            state.status = Status::Closed;
        }
        self.done.cancel();
    }

    /// Close the tunnel only if it is still IDLE. Used by the idle GC so
    /// it cannot tear down an exchange that started concurrently.
    pub fn close_if_idle(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status != Status::Idle {
                return false;
            }
            state.status = Status::Closed;
        }
        self.done.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    /// Run the four-frame exchange for one inbound request and build the
    /// proxied response. The caller must hold the tunnel via `take()`.
    /// Any error leaves the tunnel poisoned; the caller closes it.
    pub async fn proxy_request(
        self: &Arc<Self>,
        req: Request<Incoming>,
        destination: &Url,
    ) -> Result<Response<BoxBody>> {
        let (parts, body) = req.into_parts();

        let frame = RequestFrame {
            method: parts.method.to_string(),
            url: destination.to_string(),
            header: headers_to_map(&parts.headers),
            content_length: parts
                .headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
        };
        let header_json = serde_json::to_string(&frame).context("unable to serialize request")?;

        // Hold the frame receiver for the whole exchange. take() already
        // guarantees exclusivity; the lock hands us the receiver.
        let mut frames = self.frames.lock().await;

        {
            let mut sink = self.sink.lock().await;
            sink.send(Message::text(header_json))
                .await
                .context("unable to write request")?;

            let body = body
                .collect()
                .await
                .context("unable to read request body")?
                .to_bytes();
            sink.send(Message::binary(body))
                .await
                .context("unable to pipe request body")?;
        }

        let response_frame = match self.next_frame(&mut frames).await? {
            Message::Text(text) => serde_json::from_str::<ResponseFrame>(&text)
                .context("unable to deserialize response")?,
            _ => bail!("expected serialized response, got a binary frame"),
        };

        let response_body = match self.next_frame(&mut frames).await? {
            Message::Binary(data) => data,
            _ => bail!("expected response body, got a text frame"),
        };
        drop(frames);

        let status = StatusCode::from_u16(response_frame.status_code)
            .with_context(|| format!("invalid response status {}", response_frame.status_code))?;

        let mut headers = headers_from_map(&response_frame.header);
        // Recomputed by hyper for the re-assembled body.
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);

        let mut response = Response::builder().status(status);
        if let Some(map) = response.headers_mut() {
            *map = headers;
        }
        let response = response
            .body(full_body(response_body))
            .context("unable to build response")?;

        self.release();

        Ok(response)
    }

    async fn next_frame(&self, frames: &mut mpsc::Receiver<Message>) -> Result<Message> {
        tokio::select! {
            _ = self.done.cancelled() => Err(anyhow!("tunnel closed")),
            msg = frames.recv() => msg.ok_or_else(|| anyhow!("tunnel closed")),
        }
    }

    /// The only reader of the WebSocket. Polling the stream here also
    /// drives control frames; data frames are handed to the in-flight
    /// exchange one at a time. A data frame arriving while the tunnel is
    /// not BUSY is unexpected and terminates the tunnel.
    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<ServerStream>,
        handoff: mpsc::Sender<Message>,
    ) {
        loop {
            let msg = tokio::select! {
                _ = self.done.cancelled() => break,
                msg = stream.next() => msg,
            };

            let msg = match msg {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    if !self.is_closed() {
                        warn!("tunnel {}: websocket error: {err}", self.id);
                    }
                    break;
                }
                None => break,
            };

            match msg {
                Message::Text(_) | Message::Binary(_) => {
                    if self.status().0 != Status::Busy {
                        warn!("tunnel {}: unexpected frame while idle", self.id);
                        break;
                    }
                    let delivered = tokio::select! {
                        _ = self.done.cancelled() => false,
                        res = handoff.send(msg) => res.is_ok(),
                    };
                    if !delivered {
                        break;
                    }
                }
                Message::Close(_) => {
                    debug!("tunnel {}: closed by peer", self.id);
                    break;
                }
                // Ping/pong are answered by the library as we poll.
                _ => {}
            }
        }

        self.close();
        let _ = self.sink.lock().await.close().await;
    }
}
