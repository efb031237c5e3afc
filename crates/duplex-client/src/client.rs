//! The duplex client endpoint.
//!
//! Owns one transport + one message socket. `connect` starts the socket (the
//! reader waits for the link) and dials with retry; `authenticate` runs the
//! id/key handshake on the reserved channel.

use std::future::Future;
use std::sync::Arc;

use ciborium::value::Value;
use tracing::{debug, info};
use uuid::Uuid;

use duplex_core::codec::CborCodec;
use duplex_core::transport::tls;
use duplex_core::transport::{Dialer, StreamTransport, TlsClientOptions, Transport, WsTransport};
use duplex_core::{
    ConnectionStatus, DuplexResult, EventArg, EventKind, Message, MessageSocket, Registration,
    AUTH_CHANNEL, CLIENT_ID_CHANNEL,
};

use crate::config::ClientConfig;

/// A client endpoint: one connection to one duplex server.
pub struct DuplexClient {
    socket: MessageSocket,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
}

impl DuplexClient {
    /// A client over plain TCP. `addr` is `host:port`.
    pub fn tcp(addr: impl Into<String>, config: ClientConfig) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::connector(
            Dialer::Tcp { addr: addr.into() },
            Arc::new(CborCodec),
            config.max_frame_len,
        ));
        Self::from_transport(transport, config)
    }

    /// A client over TLS TCP.
    pub fn tls(
        addr: impl Into<String>,
        options: TlsClientOptions,
        config: ClientConfig,
    ) -> DuplexResult<Self> {
        let tls_config = tls::client_config(&options)?;
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::connector(
            Dialer::Tls {
                addr: addr.into(),
                domain: options.domain,
                config: tls_config,
            },
            Arc::new(CborCodec),
            config.max_frame_len,
        ));
        Ok(Self::from_transport(transport, config))
    }

    /// A client over WebSocket. `url` is `ws://host:port/` or
    /// `wss://host:port/` (the latter requires TLS options).
    pub fn websocket(
        url: &str,
        tls: Option<TlsClientOptions>,
        config: ClientConfig,
    ) -> DuplexResult<Self> {
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::connector(
            url,
            tls.as_ref(),
            Arc::new(CborCodec),
            config.max_frame_len,
        )?);
        Ok(Self::from_transport(transport, config))
    }

    /// Wrap an already-built transport (custom codecs, in-memory tests).
    pub fn from_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let socket = MessageSocket::new(transport.clone());

        // The server assigns our identity right after accept.
        let id_socket = socket.clone();
        socket.observe(CLIENT_ID_CHANNEL, move |message: Message| {
            let socket = id_socket.clone();
            async move {
                let id = message
                    .data
                    .as_ref()
                    .and_then(|v| v.as_bytes())
                    .and_then(|b| Uuid::from_slice(b).ok())
                    .or(message.target_id);
                match id {
                    Some(id) => {
                        socket.set_identity(id);
                        info!(client_id = %id, "client identity assigned");
                        socket
                            .broadcast_event(EventKind::ClientIdReceived, Arc::new(id))
                            .await;
                    }
                    None => debug!("identity assignment without an id, ignored"),
                }
                Ok(())
            }
        });

        Self {
            socket,
            transport,
            config,
        }
    }

    /// Dial the server with the configured retry policy. Status events
    /// surface on the event bus as `ConnectionStatusChanged`.
    pub async fn connect(&self) -> DuplexResult<()> {
        self.socket.start();
        self.transport
            .connect(self.config.max_retries, self.config.base_delay)
            .await
    }

    /// Run the authentication handshake.
    ///
    /// Sends `{Id, Key, Scope?}` on the reserved channel and returns the
    /// server's boolean verdict. On success the transport reports the
    /// `Authenticated` status.
    pub async fn authenticate(
        &self,
        id: &str,
        key: &str,
        scope: Option<&str>,
    ) -> DuplexResult<bool> {
        self.socket
            .broadcast_event(
                EventKind::ConnectionStatusChanged,
                Arc::new(ConnectionStatus::Authenticating),
            )
            .await;

        let mut payload = vec![
            (Value::Text("Id".into()), Value::Text(id.into())),
            (Value::Text("Key".into()), Value::Text(key.into())),
        ];
        if let Some(scope) = scope {
            payload.push((Value::Text("Scope".into()), Value::Text(scope.into())));
        }
        let request = Message::new(AUTH_CHANNEL, Some(Value::Map(payload)));
        let reply = self
            .socket
            .send_request_timeout(request, self.config.request_timeout)
            .await?;

        let success = reply
            .data_entry("Success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if success {
            self.transport.on_authenticated();
        } else {
            debug!(user = %id, "authentication rejected");
        }
        Ok(success)
    }

    /// The server-assigned identity; nil until [`EventKind::ClientIdReceived`]
    /// has fired.
    pub fn client_id(&self) -> Uuid {
        self.socket.identity()
    }

    /// The underlying message socket.
    pub fn socket(&self) -> &MessageSocket {
        &self.socket
    }

    /// Fire-and-forget send.
    pub async fn send(&self, message: Message) -> DuplexResult<()> {
        self.socket.send(message).await
    }

    /// Request/response with the configured timeout.
    pub async fn send_request(&self, request: Message) -> DuplexResult<Message> {
        self.socket
            .send_request_timeout(request, self.config.request_timeout)
            .await
    }

    /// Request/response with an explicit timeout.
    pub async fn send_request_timeout(
        &self,
        request: Message,
        timeout: std::time::Duration,
    ) -> DuplexResult<Message> {
        self.socket.send_request_timeout(request, timeout).await
    }

    /// Register an async handler that may return a reply.
    pub fn handle<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<Option<Message>>> + Send + 'static,
    {
        self.socket.handle(channel, f)
    }

    /// Register an async fire-and-forget handler.
    pub fn observe<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<()>> + Send + 'static,
    {
        self.socket.observe(channel, f)
    }

    /// Register a synchronous handler that may return a reply.
    pub fn handle_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<Option<Message>> + Send + Sync + 'static,
    {
        self.socket.handle_sync(channel, f)
    }

    /// Register a synchronous fire-and-forget handler.
    pub fn observe_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<()> + Send + Sync + 'static,
    {
        self.socket.observe_sync(channel, f)
    }

    /// Register an async event callback.
    pub fn on_event<F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(EventArg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.socket.on_event(kind, f)
    }

    /// Register a typed event callback.
    pub fn on_event_typed<T, F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        T: std::any::Any + Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.socket.on_event_typed(kind, f)
    }

    /// Tear the connection down. Idempotent.
    pub async fn disconnect(&self) {
        self.socket.dispose().await;
    }
}
