//! Length-prefixed message transport over reliable byte streams.
//!
//! One `StreamTransport` wraps one connection: either a client-side
//! [`Dialer`] (plain TCP or TLS) that `connect` drives with backoff, or a
//! server-accepted stream that is connected from birth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::codec::MessageCodec;
use crate::error::{DuplexError, DuplexResult};
use crate::framing::{read_frame, write_frame};
use crate::message::Message;
use crate::status::ConnectionStatus;
use crate::transport::{dial_with_backoff, BoxedStream, LinkState, Transport};

/// How a client-side transport reaches its peer.
pub enum Dialer {
    Tcp {
        addr: String,
    },
    Tls {
        addr: String,
        /// Server name used for SNI and, when verification is on, for
        /// hostname checking.
        domain: String,
        config: Arc<rustls::ClientConfig>,
    },
}

impl Dialer {
    async fn dial(&self) -> DuplexResult<BoxedStream> {
        match self {
            Dialer::Tcp { addr } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| DuplexError::ConnectFailed(format!("{addr}: {e}")))?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            Dialer::Tls {
                addr,
                domain,
                config,
            } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| DuplexError::ConnectFailed(format!("{addr}: {e}")))?;
                stream.set_nodelay(true).ok();
                let server_name = rustls::pki_types::ServerName::try_from(domain.clone())
                    .map_err(|e| DuplexError::Config(format!("invalid TLS domain {domain}: {e}")))?;
                let tls = TlsConnector::from(config.clone())
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| DuplexError::ConnectFailed(format!("tls handshake: {e}")))?;
                Ok(Box::new(tls))
            }
        }
    }
}

/// Framed transport over a reliable byte stream.
pub struct StreamTransport {
    dialer: Option<Dialer>,
    codec: Arc<dyn MessageCodec>,
    max_frame_len: u32,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    state_tx: watch::Sender<LinkState>,
    state_rx: watch::Receiver<LinkState>,
    status_tx: broadcast::Sender<ConnectionStatus>,
    ever_connected: AtomicBool,
    close_started: AtomicBool,
    disconnect_emitted: AtomicBool,
}

impl StreamTransport {
    /// A client-side transport; [`Transport::connect`] drives the dial.
    pub fn connector(dialer: Dialer, codec: Arc<dyn MessageCodec>, max_frame_len: u32) -> Self {
        Self::build(Some(dialer), None, codec, max_frame_len)
    }

    /// Wrap a server-accepted (already connected) stream.
    pub fn accepted(stream: BoxedStream, codec: Arc<dyn MessageCodec>, max_frame_len: u32) -> Self {
        Self::build(None, Some(stream), codec, max_frame_len)
    }

    fn build(
        dialer: Option<Dialer>,
        stream: Option<BoxedStream>,
        codec: Arc<dyn MessageCodec>,
        max_frame_len: u32,
    ) -> Self {
        let connected = stream.is_some();
        let (reader, writer) = match stream {
            Some(stream) => {
                let (r, w) = tokio::io::split(stream);
                (Some(r), Some(w))
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
            dialer,
            codec,
            max_frame_len,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state_tx,
            state_rx,
            status_tx,
            ever_connected: AtomicBool::new(connected),
            close_started: AtomicBool::new(false),
            disconnect_emitted: AtomicBool::new(false),
        }
    }

    fn emit(&self, status: ConnectionStatus) {
        trace!(status = %status, "transport status");
        let _ = self.status_tx.send(status);
    }

    /// Mark the link dead and emit `Disconnected` once.
    fn mark_closed(&self) {
        self.state_tx.send_replace(LinkState::Closed);
        if !self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            self.emit(ConnectionStatus::Disconnected);
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> DuplexResult<()> {
        let dialer = self.dialer.as_ref().ok_or_else(|| {
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
        let stream = dial_with_backoff(
            || dialer.dial(),
            max_retries,
            base_delay,
            self.state_rx.clone(),
            &self.status_tx,
            reconnect,
        )
        .await?;

        let (r, w) = tokio::io::split(stream);
        *self.reader.lock().await = Some(r);
        *self.writer.lock().await = Some(w);
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
        let mut writer = self.writer.lock().await;
        let w = writer
            .as_mut()
            .ok_or_else(|| DuplexError::Transport("not connected".into()))?;
        match write_frame(w, &bytes, self.max_frame_len).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(writer);
                self.mark_closed();
                Err(e)
            }
        }
    }

    async fn recv(&self) -> DuplexResult<Option<Message>> {
        loop {
            // Wait out link setup rather than reading partial bytes.
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

            let mut guard = self.reader.lock().await;
            let Some(reader) = guard.as_mut() else {
                drop(guard);
                if *self.state_rx.borrow() == LinkState::Closed {
                    return Ok(None);
                }
                tokio::task::yield_now().await;
                continue;
            };

            let frame = {
                let mut state = self.state_rx.clone();
                tokio::select! {
                    _ = state.wait_for(|s| *s == LinkState::Closed) => return Ok(None),
                    frame = read_frame(reader, self.max_frame_len) => frame,
                }
            };
            drop(guard);

            return match frame {
                Ok(Some(bytes)) => match self.codec.decode(&bytes) {
                    Ok(message) => Ok(Some(message)),
                    Err(e) => {
                        self.mark_closed();
                        Err(e)
                    }
                },
                Ok(None) => {
                    self.mark_closed();
                    Ok(None)
                }
                Err(e) => {
                    self.mark_closed();
                    Err(e)
                }
            };
        }
    }

    fn on_authenticated(&self) {
        self.emit(ConnectionStatus::Authenticated);
    }

    async fn close(&self) {
        if self.close_started.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the in-flight read first; it releases the reader lock.
        self.state_tx.send_replace(LinkState::Closed);
        if let Some(mut w) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = w.shutdown().await;
        }
        *self.reader.lock().await = None;
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
