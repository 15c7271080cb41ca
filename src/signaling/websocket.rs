//! Socket.IO over WebSocket transport with automatic reconnection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::events::OutboundEvent;
use super::socketio::{self, Frame};
use super::{ChannelError, SignalingChannel, Transport};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Build the Engine.IO websocket URL from the server base URL.
///
/// `http://host:5000` becomes `ws://host:5000/socket.io/?EIO=4&transport=websocket`.
pub fn socket_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).context("Invalid server URL")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => bail!("Unsupported server URL scheme: {}", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("Cannot use scheme {} for {}", scheme, server_url))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

/// Send half of the transport, shared with the signaling channel.
pub struct SocketIoTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: AtomicBool,
}

impl SocketIoTransport {
    /// Create the transport and the receiver its connection loop drains.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                outbound,
                connected: AtomicBool::new(false),
            }),
            rx,
        )
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl Transport for SocketIoTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::TransportUnavailable);
        }
        self.outbound
            .send(socketio::encode_event(event, &payload))
            .map_err(|_| ChannelError::TransportUnavailable)
    }
}

/// Run the connection with automatic reconnection.
///
/// Reconnects with exponential backoff (1s, 2s, 4s, ... capped at
/// `max_backoff`). The backoff resets after every session that got as far
/// as the namespace connect. Runs until the task is aborted.
pub async fn connect_and_run(
    url: Url,
    transport: Arc<SocketIoTransport>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    channel: SignalingChannel,
    max_backoff: Duration,
) {
    let mut backoff = Duration::from_secs(1);

    loop {
        let result = run_session(&url, &transport, &mut outbound, &channel).await;
        transport.set_connected(false);

        match result {
            Ok(()) => {
                backoff = Duration::from_secs(1);
                tracing::warn!("Socket closed by server. Reconnecting in 1s...");
            }
            Err(e) => {
                tracing::warn!(
                    "Socket disconnected: {:#}. Reconnecting in {}s...",
                    e,
                    backoff.as_secs()
                );
            }
        }

        time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

/// One full session: handshake, namespace connect, event loop.
///
/// Returns `Ok(())` when the server closes a session that had connected.
async fn run_session(
    url: &Url,
    transport: &SocketIoTransport,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    channel: &SignalingChannel,
) -> Result<()> {
    tracing::info!("Connecting WebSocket to {}", url);
    let (mut ws, response) = connect_async(url.as_str())
        .await
        .context("WebSocket connection failed")?;
    tracing::info!("WebSocket connected (status={})", response.status());

    // 1. Engine.IO open packet
    let open = match recv_frame(&mut ws).await? {
        Some(Frame::Open(info)) => info,
        Some(other) => bail!("Expected open packet, got {:?}", other),
        None => bail!("Connection closed before handshake"),
    };
    tracing::debug!(
        "Engine.IO open: sid={} pingInterval={}ms pingTimeout={}ms",
        open.sid,
        open.ping_interval,
        open.ping_timeout
    );

    // 2. Socket.IO namespace connect
    send_text(&mut ws, socketio::CONNECT).await?;
    loop {
        match recv_frame(&mut ws).await? {
            Some(Frame::Connected) => break,
            Some(Frame::ConnectError(e)) => bail!("Namespace connect refused: {}", e),
            Some(Frame::Ping) => send_text(&mut ws, socketio::PONG).await?,
            Some(other) => tracing::debug!("Ignoring {:?} before connect", other),
            None => bail!("Connection closed during namespace connect"),
        }
    }

    // Drop anything queued against the previous session: the senders
    // already treated those as possibly undelivered.
    let mut stale = 0;
    while outbound.try_recv().is_ok() {
        stale += 1;
    }
    if stale > 0 {
        tracing::debug!("Discarded {} frames from previous session", stale);
    }

    transport.set_connected(true);
    tracing::info!("Signaling connected");

    // 3. Re-join the open conversation's room.
    if let Some(chat_id) = channel.current() {
        let join = OutboundEvent::JoinChat { chat_id };
        send_text(&mut ws, &socketio::encode_event(join.name(), &join.payload())).await?;
    }

    // 4. Event loop. The server pings every pingInterval; missing one by
    //    more than pingTimeout means the connection is dead.
    let liveness = Duration::from_millis(open.ping_interval + open.ping_timeout);
    let mut deadline = Box::pin(time::sleep(liveness));

    loop {
        tokio::select! {
            frame = recv_frame(&mut ws) => {
                match frame? {
                    Some(Frame::Ping) => {
                        send_text(&mut ws, socketio::PONG).await?;
                        deadline.as_mut().reset(Instant::now() + liveness);
                    }
                    Some(Frame::Event { name, payload, .. }) => {
                        tracing::debug!("Event {}: {}", name, payload);
                        channel.dispatch(&name, &payload);
                    }
                    Some(Frame::Close) | Some(Frame::Disconnected) | None => return Ok(()),
                    Some(Frame::ConnectError(e)) => bail!("Server error: {}", e),
                    Some(other) => tracing::debug!("Ignoring {:?}", other),
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    bail!("Outbound queue closed");
                };
                send_text(&mut ws, &frame).await?;
            }
            _ = &mut deadline => {
                bail!("No ping from server within {}ms", liveness.as_millis());
            }
        }
    }
}

async fn send_text(ws: &mut WsStream, text: &str) -> Result<()> {
    tracing::debug!("WS send: {}", text);
    ws.send(Message::Text(text.to_string()))
        .await
        .context("Failed to send WebSocket message")
}

/// Receive and decode the next Engine.IO frame, answering websocket pings.
///
/// Returns `None` when the socket closes.
async fn recv_frame(ws: &mut WsStream) -> Result<Option<Frame>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                tracing::trace!("WS recv: {}", text);
                match socketio::decode(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => tracing::warn!("Dropping undecodable frame: {:#}", e),
                }
            }
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data))
                    .await
                    .context("Failed to send pong")?;
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!("WebSocket closed: {:?}", frame);
                return Ok(None);
            }
            Some(Ok(other)) => {
                tracing::debug!("WS frame (ignored): {:?}", other);
            }
            Some(Err(e)) => {
                return Err(e).context("WebSocket receive error");
            }
            None => return Ok(None),
        }
    }
}
