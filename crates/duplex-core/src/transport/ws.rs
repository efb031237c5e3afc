//! WebSocket message transport.
//!
//! Each logical message is one binary WebSocket message; fragmented inbound
//! messages are reassembled by tungstenite before they reach the codec, so
//! no length prefix is added. A `Close` frame terminates the sequence
//! cleanly, pings are answered with pongs, and text frames are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use crate::codec::MessageCodec;
use crate::error::{DuplexError, DuplexResult};
use crate::message::Message;
use crate::status::ConnectionStatus;
use crate::transport::tls::{client_config, TlsClientOptions};
use crate::transport::{dial_with_backoff, BoxedStream, LinkState, Transport};

type WsLink = WebSocketStream<BoxedStream>;

/// Parsed `ws://` / `wss://` endpoint.
struct WsTarget {
    url: String,
    host: String,
    port: u16,
    /// TLS config + server name, present for `wss://`.
    tls: Option<(Arc<rustls::ClientConfig>, String)>,
}

fn parse_target(url: &str, tls_options: Option<&TlsClientOptions>) -> DuplexResult<WsTarget> {
    let (secure, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(DuplexError::Config(format!(
            "unsupported WebSocket url: {url}"
        )));
    };

    let authority = rest.split('/').next().unwrap_or("");
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| DuplexError::Config(format!("invalid port in url: {url}")))?,
        ),
        None => (authority.to_string(), if secure { 443 } else { 80 }),
    };
    if host.is_empty() {
        return Err(DuplexError::Config(format!("missing host in url: {url}")));
    }

    let tls = if secure {
        let options = tls_options.ok_or_else(|| {
            DuplexError::Config("wss:// requires TLS client options".into())
        })?;
        let domain = if options.domain.is_empty() {
            host.clone()
        } else {
            options.domain.clone()
        };
        Some((client_config(options)?, domain))
    } else {
        None
    };

    Ok(WsTarget {
        url: url.to_string(),
        host,
        port,
        tls,
    })
}

/// WebSocket transport over one connection.
pub struct WsTransport {
    target: Option<WsTarget>,
    codec: Arc<dyn MessageCodec>,
    max_frame_len: u32,
    sink: Mutex<Option<SplitSink<WsLink, WsMessage>>>,
    stream: Mutex<Option<SplitStream<WsLink>>>,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    ever_connected: AtomicBool,
    close_started: AtomicBool,
    disconnect_emitted: AtomicBool,
}

impl WsTransport {
    /// A client-side transport for a `ws://` or `wss://` endpoint.
    pub fn connector(
        url: &str,
        tls_options: Option<&TlsClientOptions>,
        codec: Arc<dyn MessageCodec>,
        max_frame_len: u32,
    ) -> DuplexResult<Self> {
        let target = parse_target(url, tls_options)?;
        Ok(Self::build(Some(target), None, codec, max_frame_len))
    }

    /// Wrap a server-accepted, already-upgraded WebSocket.
    pub fn accepted(ws: WsLink, codec: Arc<dyn MessageCodec>, max_frame_len: u32) -> Self {
        Self::build(None, Some(ws), codec, max_frame_len)
    }

    fn build(
        target: Option<WsTarget>,
        ws: Option<WsLink>,
        codec: Arc<dyn MessageCodec>,
        max_frame_len: u32,
    ) -> Self {
        let connected = ws.is_some();
        let (sink, stream) = match ws {
            Some(ws) => {
                let (sink, stream) = ws.split();
                (Some(sink), Some(stream))
            }
            None => (None, None),
        };
        let (state_tx, state_rx) = watch::channel(if connected {
            LinkState::Connected
        } else {
            LinkState::Idle
        });
        let (status_tx, _) = broadcast::channel(32);
        Self {
            target,
            codec,
            max_frame_len,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            state_tx,
            state_rx,
            status_tx,
            ever_connected: AtomicBool::new(connected),
            close_started: AtomicBool::new(false),
            disconnect_emitted: AtomicBool::new(false),
        }
    }

    async fn dial(target: &WsTarget) -> DuplexResult<WsLink> {
        let stream = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|e| {
                DuplexError::ConnectFailed(format!("{}:{}: {e}", target.host, target.port))
            })?;
        stream.set_nodelay(true).ok();

        let stream: BoxedStream = match &target.tls {
            Some((config, domain)) => {
                let server_name = rustls::pki_types::ServerName::try_from(domain.clone())
                    .map_err(|e| {
                        DuplexError::Config(format!("invalid TLS domain {domain}: {e}"))
                    })?;
                let tls = TlsConnector::from(config.clone())
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| DuplexError::ConnectFailed(format!("tls handshake: {e}")))?;
                Box::new(tls)
            }
            None => Box::new(stream),
        };

        let (ws, _response) = tokio_tungstenite::client_async(target.url.as_str(), stream)
            .await
            .map_err(|e| DuplexError::ConnectFailed(format!("websocket handshake: {e}")))?;
        Ok(ws)
    }

    fn emit(&self, status: ConnectionStatus) {
        trace!(status = %status, "transport status");
        let _ = self.status_tx.send(status);
    }

    fn mark_closed(&self) {
        self.state_tx.send_replace(LinkState::Closed);
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            self.emit(ConnectionStatus::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> DuplexResult<()> {
        let target = self.target.as_ref().ok_or_else(|| {
            DuplexError::Config("accepted transport is already connected".into())
        })?;
        if *self.state_rx.borrow() == LinkState::Connected {
            return Ok(());
        }
        // Dialing again after a close starts a fresh link session.
        if *self.state_rx.borrow() == LinkState::Closed {
            self.state_tx.send_replace(LinkState::Idle);
            self.close_started.store(false, Ordering::SeqCst);
            self.disconnect_emitted.store(false, Ordering::SeqCst);
        }
        let reconnect = self.ever_connected.load(Ordering::SeqCst);
        let ws = dial_with_backoff(
            || Self::dial(target),
            max_retries,
            base_delay,
            self.state_rx.clone(),
            &self.status_tx,
            reconnect,
        )
        .await?;

        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.state_tx.send_replace(LinkState::Connected);
        self.ever_connected.store(true, Ordering::SeqCst);
        self.emit(if reconnect {
            ConnectionStatus::Reconnected
        } else {
            ConnectionStatus::Connected
        });
        Ok(())
    }

    async fn send(&self, message: &Message) -> DuplexResult<()> {
        let bytes = self.codec.encode(message)?;
        if bytes.len() > self.max_frame_len as usize {
            return Err(DuplexError::Framing(format!(
                "message too large: {} bytes (max {})",
                bytes.len(),
                self.max_frame_len
            )));
        }
        let mut sink = self.sink.lock().await;
        let s = sink
            .as_mut()
            .ok_or_else(|| DuplexError::Transport("not connected".into()))?;
        match s.send(WsMessage::Binary(bytes.into())).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(sink);
                self.mark_closed();
                Err(DuplexError::Transport(format!("websocket send: {e}")))
            }
        }
    }

    async fn recv(&self) -> DuplexResult<Option<Message>> {
        loop {
            {
                let mut state = self.state_rx.clone();
                let current = *state.borrow_and_update();
                match current {
                    LinkState::Closed => return Ok(None),
                    LinkState::Idle => {
                        if state
                            .wait_for(|s| !matches!(s, LinkState::Idle))
                            .await
                            .is_err()
                        {
                            return Ok(None);
                        }
                        continue;
                    }
                    LinkState::Connected => {}
                }
            }

            let mut guard = self.stream.lock().await;
            let Some(stream) = guard.as_mut() else {
                drop(guard);
                if *self.state_rx.borrow() == LinkState::Closed {
                    return Ok(None);
                }
                tokio::task::yield_now().await;
                continue;
            };

            let mut state = self.state_rx.clone();
            let item = tokio::select! {
                _ = state.wait_for(|s| *s == LinkState::Closed) => return Ok(None),
                item = stream.next() => item,
            };
            drop(guard);

            match item {
                Some(Ok(WsMessage::Binary(data))) => {
                    if data.len() > self.max_frame_len as usize {
                        self.mark_closed();
                        return Err(DuplexError::Framing(format!(
                            "inbound message too large: {} bytes (max {})",
                            data.len(),
                            self.max_frame_len
                        )));
                    }
                    return match self.codec.decode(&data) {
                        Ok(message) => Ok(Some(message)),
                        Err(e) => {
                            self.mark_closed();
                            Err(e)
                        }
                    };
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let mut sink = self.sink.lock().await;
                    if let Some(s) = sink.as_mut() {
                        let _ = s.send(WsMessage::Pong(payload)).await;
                    }
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.mark_closed();
                    return Ok(None);
                }
                Some(Ok(_)) => continue, // text, pong, raw frames
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(DuplexError::Transport(format!("websocket recv: {e}")));
                }
            }
        }
    }

    fn on_authenticated(&self) {
        self.emit(ConnectionStatus::Authenticated);
    }

    async fn close(&self) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(LinkState::Closed);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        *self.stream.lock().await = None;
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            self.emit(ConnectionStatus::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        *self.state_rx.borrow() == LinkState::Connected
    }

    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}
