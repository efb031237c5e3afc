//! The duplex server endpoint.
//!
//! Owns the listener and the client registry. Each accepted connection gets
//! its own transport and [`ConnectedClient`]; channel handlers registered on
//! the server are blueprints applied to every current and future client.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use ciborium::value::Value;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use duplex_core::codec::{CborCodec, MessageCodec};
use duplex_core::{
    DuplexError, DuplexResult, ErrorHandler, Message, MessageSocket, Registration,
    CLIENT_ID_CHANNEL,
};

use crate::auth::{AuthContext, AuthHandler};
use crate::config::ServerConfig;
use crate::connected::ConnectedClient;
use crate::listener::Listener;

type Applier = Arc<dyn Fn(&MessageSocket) -> Registration + Send + Sync>;
type ConnectedCallback = Arc<dyn Fn(Arc<ConnectedClient>) + Send + Sync>;
type DisconnectedCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// A server-wide handler registration, applied to every client socket.
struct Blueprint {
    id: u64,
    applier: Applier,
    live: Mutex<HashMap<Uuid, Registration>>,
}

impl Blueprint {
    fn apply_to(&self, client: &ConnectedClient) {
        let mut live = lock(&self.live);
        if live.contains_key(&client.id()) {
            return;
        }
        let registration = (self.applier)(client.socket());
        live.insert(client.id(), registration);
    }
}

struct ServerShared {
    config: ServerConfig,
    listener: Listener,
    codec: Arc<dyn MessageCodec>,
    clients: RwLock<HashMap<Uuid, Arc<ConnectedClient>>>,
    blueprints: Mutex<Vec<Arc<Blueprint>>>,
    auth_handler: Mutex<Option<AuthHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    on_connected: Mutex<Vec<ConnectedCallback>>,
    on_disconnected: Mutex<Vec<DisconnectedCallback>>,
    next_id: AtomicU64,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// The duplex server: listener, client registry, and broadcast routing.
#[derive(Clone)]
pub struct DuplexServer {
    inner: Arc<ServerShared>,
}

impl DuplexServer {
    /// Bind the configured listener. The accept loop starts with
    /// [`DuplexServer::start`].
    pub async fn bind(config: ServerConfig) -> DuplexResult<Self> {
        let listener = Listener::bind(&config).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerShared {
                config,
                listener,
                codec: Arc::new(CborCodec),
                clients: RwLock::new(HashMap::new()),
                blueprints: Mutex::new(Vec::new()),
                auth_handler: Mutex::new(None),
                error_handler: Mutex::new(None),
                on_connected: Mutex::new(Vec::new()),
                on_disconnected: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                shutdown_tx,
            }),
        })
    }

    /// The bound listener address (useful with an ephemeral port).
    pub fn local_addr(&self) -> DuplexResult<SocketAddr> {
        self.inner.listener.local_addr()
    }

    /// Install the handshake verdict hook applied to newly accepted clients.
    pub fn set_auth_handler<F, Fut>(&self, f: F)
    where
        F: Fn(String, String, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AuthContext> + Send + 'static,
    {
        *lock(&self.inner.auth_handler) = Some(Arc::new(
            move |id, key, scope| -> crate::auth::AuthFuture { Box::pin(f(id, key, scope)) },
        ));
    }

    /// Install the error-reply synthesizer used by all connected clients.
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Message, &DuplexError) -> Option<Message> + Send + Sync + 'static,
    {
        *lock(&self.inner.error_handler) = Some(Arc::new(f));
    }

    /// Observe accepted clients. Fires before the client's inbound loop
    /// dispatches its first message.
    pub fn on_client_connected<F>(&self, f: F)
    where
        F: Fn(Arc<ConnectedClient>) + Send + Sync + 'static,
    {
        lock(&self.inner.on_connected).push(Arc::new(f));
    }

    /// Observe departures; fires after the client's socket has shut down and
    /// the registry entry is gone.
    pub fn on_client_disconnected<F>(&self, f: F)
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        lock(&self.inner.on_disconnected).push(Arc::new(f));
    }

    // ── Shared handler registration ────────────────────────────────────

    /// Register an async handler (may reply) on every current and future
    /// client.
    pub fn handle<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<Option<Message>>> + Send + 'static,
    {
        let f = Arc::new(f);
        let channel = channel.to_string();
        self.add_blueprint(Arc::new(move |socket: &MessageSocket| {
            let f = f.clone();
            socket.handle(&channel, move |message| (f)(message))
        }))
    }

    /// Register an async fire-and-forget handler on every current and
    /// future client.
    pub fn observe<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let channel = channel.to_string();
        self.add_blueprint(Arc::new(move |socket: &MessageSocket| {
            let f = f.clone();
            socket.observe(&channel, move |message| (f)(message))
        }))
    }

    /// Synchronous responding variant of [`DuplexServer::handle`].
    pub fn handle_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<Option<Message>> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let channel = channel.to_string();
        self.add_blueprint(Arc::new(move |socket: &MessageSocket| {
            let f = f.clone();
            socket.handle_sync(&channel, move |message| (f)(message))
        }))
    }

    /// Synchronous fire-and-forget variant of [`DuplexServer::observe`].
    pub fn observe_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let channel = channel.to_string();
        self.add_blueprint(Arc::new(move |socket: &MessageSocket| {
            let f = f.clone();
            socket.observe_sync(&channel, move |message| (f)(message))
        }))
    }

    fn add_blueprint(&self, applier: Applier) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let blueprint = Arc::new(Blueprint {
            id,
            applier,
            live: Mutex::new(HashMap::new()),
        });
        lock(&self.inner.blueprints).push(blueprint.clone());

        let clients: Vec<Arc<ConnectedClient>> = read_lock(&self.inner.clients)
            .values()
            .cloned()
            .collect();
        for client in clients {
            blueprint.apply_to(&client);
        }

        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.blueprints).retain(|b| b.id != id);
            }
            for (_, registration) in lock(&blueprint.live).drain() {
                registration.unregister();
            }
        })
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Spawn the accept loop. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut shutdown = inner.shutdown_tx.subscribe();
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = inner.listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                if let Err(e) = admit(inner, stream, remote).await {
                                    warn!(remote = %remote, error = %e, "connection setup failed");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    },
                }
            }
            debug!("accept loop stopped");
        });
    }

    /// Stop accepting and dispose every connected client.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let clients: Vec<Arc<ConnectedClient>> = read_lock(&self.inner.clients)
            .values()
            .cloned()
            .collect();
        for client in clients {
            client.dispose().await;
        }
        info!("server shut down");
    }

    // ── Routing ────────────────────────────────────────────────────────

    /// Fan a message out to every connected client concurrently.
    pub async fn broadcast(&self, message: Message) {
        let clients: Vec<Arc<ConnectedClient>> = read_lock(&self.inner.clients)
            .values()
            .cloned()
            .collect();
        let sends = clients.iter().map(|client| {
            let message = message.clone();
            async move { (client.id(), client.send(message).await) }
        });
        for (id, result) in futures_util::future::join_all(sends).await {
            if let Err(e) = result {
                warn!(client_id = %id, error = %e, "broadcast delivery failed");
            }
        }
    }

    /// Send a message to one client.
    pub async fn send_to_client(&self, id: Uuid, mut message: Message) -> DuplexResult<()> {
        let client = read_lock(&self.inner.clients)
            .get(&id)
            .cloned()
            .ok_or(DuplexError::ClientNotConnected(id))?;
        message.target_id = Some(id);
        client.send(message).await
    }

    /// Drop a client from the registry. The connected-client socket calls
    /// this through its close hook, so the registry never needs polling.
    pub fn remove_client(&self, id: Uuid) {
        drop_client(&self.inner, id);
    }

    /// Look up a connected client.
    pub fn client(&self, id: Uuid) -> Option<Arc<ConnectedClient>> {
        read_lock(&self.inner.clients).get(&id).cloned()
    }

    pub fn client_count(&self) -> usize {
        read_lock(&self.inner.clients).len()
    }
}

/// Per-connection setup: transport, connected client, registry entry,
/// identity assignment, then the inbound loop.
async fn admit(
    inner: Arc<ServerShared>,
    stream: TcpStream,
    remote: SocketAddr,
) -> DuplexResult<()> {
    let transport = inner
        .listener
        .establish(stream, inner.codec.clone(), inner.config.max_frame_len)
        .await?;

    let client_id = Uuid::new_v4();
    let auth_handler = lock(&inner.auth_handler).clone();
    let error_handler = lock(&inner.error_handler).clone();
    let client = ConnectedClient::new(
        client_id,
        transport,
        auth_handler,
        error_handler,
        inner.config.disallow_anonymous,
    );

    {
        let weak = Arc::downgrade(&inner);
        client.socket().set_on_close(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                drop_client(&inner, client_id);
            }
        }));
    }

    write_lock(&inner.clients).insert(client_id, client.clone());

    let blueprints: Vec<Arc<Blueprint>> = lock(&inner.blueprints).clone();
    for blueprint in blueprints {
        blueprint.apply_to(&client);
    }

    info!(remote = %remote, client_id = %client_id, "client connected");
    let callbacks: Vec<ConnectedCallback> = lock(&inner.on_connected).clone();
    for callback in callbacks {
        callback(client.clone());
    }

    // Tell the client who it is before any application traffic flows back.
    let mut assignment = Message::new(
        CLIENT_ID_CHANNEL,
        Some(Value::Bytes(client_id.as_bytes().to_vec())),
    );
    assignment.target_id = Some(client_id);
    if let Err(e) = client.socket().send(assignment).await {
        // The loop never started, so the close hook will not fire.
        drop_client(&inner, client_id);
        return Err(e);
    }

    client.socket().start();
    Ok(())
}

fn drop_client(inner: &Arc<ServerShared>, id: Uuid) {
    let removed = write_lock(&inner.clients).remove(&id);
    if removed.is_none() {
        return;
    }
    for blueprint in lock(&inner.blueprints).iter() {
        lock(&blueprint.live).remove(&id);
    }
    info!(client_id = %id, "client disconnected");
    let callbacks: Vec<DisconnectedCallback> = lock(&inner.on_disconnected).clone();
    for callback in callbacks {
        callback(id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    #[tokio::test]
    async fn bind_on_ephemeral_port() {
        let server = DuplexServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn tls_bind_without_cert_fails() {
        let result = DuplexServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            transport: TransportKind::Tls,
            ..Default::default()
        })
        .await;
        assert!(matches!(result, Err(DuplexError::Config(_))));
    }

    #[tokio::test]
    async fn send_to_unknown_client_fails() {
        let server = DuplexServer::bind(ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let id = Uuid::new_v4();
        let result = server.send_to_client(id, Message::new("x", None)).await;
        assert!(matches!(result, Err(DuplexError::ClientNotConnected(e)) if e == id));
    }
}
