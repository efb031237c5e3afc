//! Listener setup and per-connection transport establishment.
//!
//! One bound TCP listener serves all flavors; `establish` performs the
//! per-connection work (TLS accept, WebSocket upgrade) off the accept loop
//! so a slow handshake never blocks other clients.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use duplex_core::codec::MessageCodec;
use duplex_core::transport::tls;
use duplex_core::transport::{BoxedStream, StreamTransport, Transport, WsTransport};
use duplex_core::{DuplexError, DuplexResult};

use crate::config::{ServerConfig, TransportKind};

#[derive(Debug, Clone, Copy)]
enum ListenerKind {
    Stream,
    WebSocket,
}

pub(crate) struct Listener {
    tcp: TcpListener,
    kind: ListenerKind,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub(crate) async fn bind(config: &ServerConfig) -> DuplexResult<Self> {
        config.validate()?;
        let tls = if config.transport.uses_tls() {
            match (&config.cert_path, &config.key_path) {
                (Some(cert), Some(key)) => Some(TlsAcceptor::from(tls::server_config(cert, key)?)),
                _ => {
                    return Err(DuplexError::Config(
                        "TLS listener requires cert and key paths".into(),
                    ))
                }
            }
        } else {
            None
        };
        let kind = match config.transport {
            TransportKind::Tcp | TransportKind::Tls => ListenerKind::Stream,
            TransportKind::WebSocket | TransportKind::WebSocketTls => ListenerKind::WebSocket,
        };
        let tcp = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| DuplexError::Transport(format!("bind {}: {e}", config.bind_addr)))?;
        Ok(Self { tcp, kind, tls })
    }

    pub(crate) fn local_addr(&self) -> DuplexResult<SocketAddr> {
        self.tcp
            .local_addr()
            .map_err(|e| DuplexError::Transport(format!("local_addr: {e}")))
    }

    pub(crate) async fn accept(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.tcp.accept().await
    }

    /// Turn an accepted TCP stream into a connected message transport.
    pub(crate) async fn establish(
        &self,
        stream: TcpStream,
        codec: Arc<dyn MessageCodec>,
        max_frame_len: u32,
    ) -> DuplexResult<Arc<dyn Transport>> {
        stream.set_nodelay(true).ok();
        match self.kind {
            ListenerKind::Stream => {
                let boxed: BoxedStream = match &self.tls {
                    Some(acceptor) => Box::new(
                        acceptor
                            .accept(stream)
                            .await
                            .map_err(|e| DuplexError::Transport(format!("tls accept: {e}")))?,
                    ),
                    None => Box::new(stream),
                };
                Ok(Arc::new(StreamTransport::accepted(
                    boxed,
                    codec,
                    max_frame_len,
                )))
            }
            ListenerKind::WebSocket => {
                let boxed: BoxedStream = match &self.tls {
                    Some(acceptor) => Box::new(
                        acceptor
                            .accept(stream)
                            .await
                            .map_err(|e| DuplexError::Transport(format!("tls accept: {e}")))?,
                    ),
                    None => {
                        reject_non_websocket(&stream).await?;
                        Box::new(stream)
                    }
                };
                let ws = tokio_tungstenite::accept_async(boxed)
                    .await
                    .map_err(|e| {
                        DuplexError::Transport(format!("websocket handshake: {e}"))
                    })?;
                Ok(Arc::new(WsTransport::accepted(ws, codec, max_frame_len)))
            }
        }
    }
}

/// Peek the plain-TCP request head; a non-upgrade HTTP request is answered
/// with `400 Bad Request` and rejected before tungstenite sees the stream.
async fn reject_non_websocket(stream: &TcpStream) -> DuplexResult<()> {
    let mut buf = [0u8; 2048];
    let mut seen = 0usize;
    // Wait for the header block (or enough of it to judge).
    for _ in 0..50 {
        let n = stream
            .peek(&mut buf)
            .await
            .map_err(|e| DuplexError::Transport(format!("peek: {e}")))?;
        if n == 0 {
            return Err(DuplexError::Transport(
                "connection closed before handshake".into(),
            ));
        }
        let head = &buf[..n];
        if contains(head, b"\r\n\r\n") || n == buf.len() {
            if is_websocket_upgrade(head) {
                return Ok(());
            }
            break;
        }
        if n == seen {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        seen = n;
    }

    debug!("non-websocket request on websocket listener, replying 400");
    let response = b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
    let mut written = 0;
    while written < response.len() {
        stream
            .writable()
            .await
            .map_err(|e| DuplexError::Transport(format!("write 400: {e}")))?;
        match stream.try_write(&response[written..]) {
            Ok(n) => written += n,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(DuplexError::Transport(format!("write 400: {e}"))),
        }
    }
    Err(DuplexError::Transport(
        "not a websocket upgrade request".into(),
    ))
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    let lower: Vec<u8> = head.iter().map(u8::to_ascii_lowercase).collect();
    contains(&lower, b"upgrade: websocket") && contains(&lower, b"sec-websocket-key")
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
