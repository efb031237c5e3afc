//! The per-connection message socket.
//!
//! A [`MessageSocket`] owns one [`Transport`], runs the single inbound
//! dispatch loop, and keeps the channel-handler and event registries. Both
//! endpoints are symmetric from here down: the client wraps one socket, the
//! server wraps one per accepted connection.
//!
//! Handlers for a channel run sequentially in arrival order; that is the
//! only ordering guarantee. Registries are snapshotted before iteration so a
//! handler may freely register or unregister during dispatch (the
//! request/response one-shot relies on this).

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::{DuplexError, DuplexResult};
use crate::event::{EventArg, EventKind};
use crate::message::Message;
use crate::status::ConnectionStatus;
use crate::transport::Transport;

/// Default timeout for [`MessageSocket::send_request`].
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

type HandlerFuture = Pin<Box<dyn Future<Output = DuplexResult<Option<Message>>> + Send>>;
type HandlerFn = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;
type EventFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EventFn = Arc<dyn Fn(EventArg) -> EventFuture + Send + Sync>;

/// Synthesizes a failure reply from a responding handler's error. Returning
/// `None` suppresses the reply; correlation fields are stamped by the socket.
pub type ErrorHandler = Arc<dyn Fn(&Message, &DuplexError) -> Option<Message> + Send + Sync>;

/// Per-message admission check run before dispatch. A `false` verdict drops
/// the message.
pub type MessageGate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

struct HandlerEntry {
    id: u64,
    func: HandlerFn,
    responding: bool,
}

struct EventEntry {
    id: u64,
    func: EventFn,
}

struct SocketShared {
    transport: Arc<dyn Transport>,
    identity: Mutex<Uuid>,
    handlers: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    events: Mutex<HashMap<EventKind, Vec<EventEntry>>>,
    error_handler: Mutex<Option<ErrorHandler>>,
    gate: Mutex<Option<MessageGate>>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    next_id: AtomicU64,
    started: AtomicBool,
    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Idempotent unregister capability returned by every registration.
#[derive(Clone)]
pub struct Registration {
    cancel: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl Registration {
    /// Wrap a cancel action. Composite registrations (e.g. one handler
    /// applied across many sockets) build on this.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(Some(Box::new(cancel)))),
        }
    }

    /// Remove exactly the handler this registration added. Safe to call more
    /// than once.
    pub fn unregister(&self) {
        let cancel = lock(&self.cancel).take();
        if let Some(cancel) = cancel {
            cancel();
        }
    }
}

/// The per-connection dispatch engine.
#[derive(Clone)]
pub struct MessageSocket {
    inner: Arc<SocketShared>,
}

impl MessageSocket {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SocketShared {
                transport,
                identity: Mutex::new(Uuid::nil()),
                handlers: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                error_handler: Mutex::new(None),
                gate: Mutex::new(None),
                on_close: Mutex::new(None),
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// The identity stamped as `sender_id` on outgoing messages. Nil until a
    /// client learns its assigned id; always nil on the server side.
    pub fn identity(&self) -> Uuid {
        *lock(&self.inner.identity)
    }

    pub fn set_identity(&self, id: Uuid) {
        *lock(&self.inner.identity) = id;
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *lock(&self.inner.error_handler) = Some(handler);
    }

    pub fn set_gate(&self, gate: MessageGate) {
        *lock(&self.inner.gate) = Some(gate);
    }

    /// Hook invoked once, after the inbound loop has exited and the socket
    /// has been torn down.
    pub fn set_on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        *lock(&self.inner.on_close) = Some(hook);
    }

    /// Number of handlers currently registered on `channel`.
    pub fn handler_count(&self, channel: &str) -> usize {
        lock(&self.inner.handlers)
            .get(channel)
            .map_or(0, Vec::len)
    }

    // ── Registration ───────────────────────────────────────────────────

    /// Register an async handler that may return a reply.
    pub fn handle<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<Option<Message>>> + Send + 'static,
    {
        self.register_handler(
            channel,
            true,
            Arc::new(move |message| -> HandlerFuture { Box::pin(f(message)) }),
        )
    }

    /// Register an async fire-and-forget handler.
    pub fn observe<F, Fut>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DuplexResult<()>> + Send + 'static,
    {
        self.register_handler(
            channel,
            false,
            Arc::new(move |message| -> HandlerFuture {
                let fut = f(message);
                Box::pin(async move { fut.await.map(|()| None) })
            }),
        )
    }

    /// Register a synchronous handler that may return a reply.
    pub fn handle_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<Option<Message>> + Send + Sync + 'static,
    {
        self.register_handler(
            channel,
            true,
            Arc::new(move |message| -> HandlerFuture {
                let result = f(message);
                Box::pin(async move { result })
            }),
        )
    }

    /// Register a synchronous fire-and-forget handler.
    pub fn observe_sync<F>(&self, channel: &str, f: F) -> Registration
    where
        F: Fn(Message) -> DuplexResult<()> + Send + Sync + 'static,
    {
        self.register_handler(
            channel,
            false,
            Arc::new(move |message| -> HandlerFuture {
                let result = f(message).map(|()| None);
                Box::pin(async move { result })
            }),
        )
    }

    /// Register an async event callback.
    pub fn on_event<F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(EventArg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_event(kind, Arc::new(move |arg| -> EventFuture { Box::pin(f(arg)) }))
    }

    /// Register a synchronous event callback.
    pub fn on_event_sync<F>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(EventArg) + Send + Sync + 'static,
    {
        self.register_event(
            kind,
            Arc::new(move |arg| -> EventFuture {
                f(arg);
                Box::pin(std::future::ready(()))
            }),
        )
    }

    /// Register a typed event callback; a payload of a different type is
    /// skipped with a debug log.
    pub fn on_event_typed<T, F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        T: Any + Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.register_event(
            kind,
            Arc::new(move |arg: EventArg| -> EventFuture {
                match arg.downcast::<T>() {
                    Ok(value) => Box::pin(f((*value).clone())),
                    Err(_) => {
                        debug!(kind = ?kind, "event payload type mismatch, callback skipped");
                        Box::pin(std::future::ready(()))
                    }
                }
            }),
        )
    }

    fn register_handler(&self, channel: &str, responding: bool, func: HandlerFn) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.handlers)
            .entry(channel.to_string())
            .or_default()
            .push(HandlerEntry {
                id,
                func,
                responding,
            });

        let weak = Arc::downgrade(&self.inner);
        let channel = channel.to_string();
        Registration::new(move || unregister_handler(&weak, &channel, id))
    }

    fn register_event(&self, kind: EventKind, func: EventFn) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.events)
            .entry(kind)
            .or_default()
            .push(EventEntry { id, func });

        let weak = Arc::downgrade(&self.inner);
        Registration::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut events = lock(&inner.events);
                if let Some(list) = events.get_mut(&kind) {
                    list.retain(|e| e.id != id);
                    if list.is_empty() {
                        events.remove(&kind);
                    }
                }
            }
        })
    }

    // ── Sending ────────────────────────────────────────────────────────

    /// Stamp the own identity and write the message.
    pub async fn send(&self, mut message: Message) -> DuplexResult<()> {
        message.sender_id = self.identity();
        self.inner.transport.send(&message).await
    }

    /// Stamp reply correlation fields against `request` and send.
    ///
    /// Used by the dispatch loop for handler-returned replies, and by
    /// handlers that need to reply before performing a side effect (the auth
    /// gate replies before closing a rejected connection).
    pub async fn send_reply(&self, mut reply: Message, request: &Message) -> DuplexResult<()> {
        reply.reply_to = Some(request.message_id);
        reply.target_id = Some(request.sender_id);
        self.send(reply).await
    }

    /// Send `request` and await the correlated reply with the default
    /// timeout.
    pub async fn send_request(&self, request: Message) -> DuplexResult<Message> {
        self.send_request_timeout(request, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Send `request` and await the correlated reply.
    ///
    /// A one-shot handler is registered on the derived reply channel before
    /// the request is written, so a reply that races the send cannot be
    /// lost. Losing the race against `timeout` unregisters the one-shot and
    /// fails with [`DuplexError::Timeout`].
    pub async fn send_request_timeout(
        &self,
        request: Message,
        timeout: Duration,
    ) -> DuplexResult<Message> {
        let request_id = request.message_id;
        let reply_channel = Message::reply_channel(&request.channel, request_id);

        let (tx, rx) = oneshot::channel::<Message>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let registration = self.register_handler(
            &reply_channel,
            false,
            Arc::new(move |reply: Message| -> HandlerFuture {
                let slot = slot.clone();
                Box::pin(async move {
                    if reply.reply_to == Some(request_id) {
                        if let Some(tx) = lock(&slot).take() {
                            let _ = tx.send(reply);
                        }
                    }
                    Ok(None)
                })
            }),
        );

        if let Err(e) = self.send(request).await {
            registration.unregister();
            return Err(e);
        }

        // A disposed socket drops the reply slot; park instead of erroring so
        // the race still resolves as a timeout rather than a cancellation.
        let reply = async move {
            match rx.await {
                Ok(message) => message,
                Err(_) => std::future::pending().await,
            }
        };
        match tokio::time::timeout(timeout, reply).await {
            Ok(message) => {
                registration.unregister();
                Ok(message)
            }
            Err(_) => {
                registration.unregister();
                Err(DuplexError::Timeout)
            }
        }
    }

    // ── Events ─────────────────────────────────────────────────────────

    /// Invoke every callback registered for `kind` with `arg`.
    pub async fn broadcast_event(&self, kind: EventKind, arg: EventArg) {
        let snapshot: Vec<EventFn> = lock(&self.inner.events)
            .get(&kind)
            .map(|list| list.iter().map(|e| e.func.clone()).collect())
            .unwrap_or_default();
        for func in snapshot {
            func(arg.clone()).await;
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Spawn the inbound loop and the status forwarder. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let status_rx = self.inner.transport.subscribe_status();
        let socket = self.clone();
        tokio::spawn(async move { socket.forward_status(status_rx).await });
        let socket = self.clone();
        tokio::spawn(async move { socket.run_inbound().await });
    }

    /// Cancel the inbound loop at its next suspension point and close the
    /// transport. The loop performs the final teardown (terminal event,
    /// registry clearing, close hook) on its way out. Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.transport.close().await;
        let _ = self.inner.shutdown_tx.send(true);
    }

    /// Forward non-terminal status changes onto the event bus. The terminal
    /// `Disconnected` is delivered by the inbound loop itself so it cannot
    /// race the registry teardown.
    async fn forward_status(&self, mut status_rx: broadcast::Receiver<ConnectionStatus>) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                status = status_rx.recv() => match status {
                    Ok(ConnectionStatus::Disconnected) => break,
                    Ok(status) => {
                        self.broadcast_event(
                            EventKind::ConnectionStatusChanged,
                            Arc::new(status),
                        )
                        .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status observer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_inbound(&self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.inner.transport.recv() => match received {
                    Ok(Some(message)) => self.dispatch(message).await,
                    Ok(None) => break,
                    Err(e) => {
                        if self.inner.transport.is_connected() {
                            warn!(error = %e, "receive error, continuing");
                            continue;
                        }
                        warn!(error = %e, "receive sequence terminated");
                        break;
                    }
                },
            }
        }

        // Teardown order matters: the terminal event must reach subscribers
        // before the registries are cleared, and the close hook runs last so
        // the server's registry view stays consistent.
        self.inner.transport.close().await;
        self.inner.disposed.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);
        self.broadcast_event(
            EventKind::ConnectionStatusChanged,
            Arc::new(ConnectionStatus::Disconnected),
        )
        .await;
        lock(&self.inner.handlers).clear();
        lock(&self.inner.events).clear();
        let hook = lock(&self.inner.on_close).take();
        if let Some(hook) = hook {
            hook();
        }
        debug!("inbound loop ended");
    }

    async fn dispatch(&self, message: Message) {
        let gate = lock(&self.inner.gate).clone();
        if let Some(gate) = gate {
            if !gate(&message) {
                debug!(
                    channel = %message.channel,
                    sender = %message.sender_id,
                    "message rejected, dropped"
                );
                return;
            }
        }

        let snapshot: Vec<(HandlerFn, bool)> = lock(&self.inner.handlers)
            .get(&message.channel)
            .map(|list| list.iter().map(|e| (e.func.clone(), e.responding)).collect())
            .unwrap_or_default();
        if snapshot.is_empty() {
            trace!(channel = %message.channel, "no handlers registered");
            return;
        }

        for (func, responding) in snapshot {
            match func(message.clone()).await {
                Ok(Some(reply)) => {
                    if let Err(e) = self.send_reply(reply, &message).await {
                        warn!(channel = %message.channel, error = %e, "failed to send reply");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let error_handler = lock(&self.inner.error_handler).clone();
                    match error_handler {
                        Some(handler) if responding => {
                            if let Some(reply) = handler(&message, &e) {
                                if let Err(send_err) = self.send_reply(reply, &message).await {
                                    warn!(
                                        channel = %message.channel,
                                        error = %send_err,
                                        "failed to send error reply"
                                    );
                                }
                            }
                        }
                        _ => {
                            warn!(channel = %message.channel, error = %e, "handler failed");
                        }
                    }
                }
            }
        }
    }
}

fn unregister_handler(weak: &Weak<SocketShared>, channel: &str, id: u64) {
    if let Some(inner) = weak.upgrade() {
        let mut handlers = lock(&inner.handlers);
        if let Some(list) = handlers.get_mut(channel) {
            list.retain(|e| e.id != id);
            if list.is_empty() {
                handlers.remove(channel);
            }
        }
    }
}

/// Registries hold plain data, so a poisoned lock carries no torn state
/// worth propagating.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CborCodec;
    use crate::codec::MessageCodec;
    use crate::framing::DEFAULT_MAX_FRAME_LEN;
    use crate::transport::StreamTransport;
    use ciborium::value::Value;
    use tokio::sync::mpsc;

    fn socket_pair() -> (MessageSocket, MessageSocket) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let codec: Arc<dyn MessageCodec> = Arc::new(CborCodec);
        let ta: Arc<dyn Transport> = Arc::new(StreamTransport::accepted(
            Box::new(a),
            codec.clone(),
            DEFAULT_MAX_FRAME_LEN,
        ));
        let tb: Arc<dyn Transport> = Arc::new(StreamTransport::accepted(
            Box::new(b),
            codec,
            DEFAULT_MAX_FRAME_LEN,
        ));
        (MessageSocket::new(ta), MessageSocket::new(tb))
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (client, server) = socket_pair();
        let server_id = Uuid::nil();
        let client_id = Uuid::new_v4();
        client.set_identity(client_id);

        server.handle("echo", |message: Message| async move {
            Ok(Some(Message::reply(&message, message.data.clone())))
        });
        client.start();
        server.start();

        let request = Message::new("echo", Some(Value::Text("hi".into())));
        let request_id = request.message_id;
        let reply = client.send_request(request).await.unwrap();

        assert_eq!(reply.channel, Message::reply_channel("echo", request_id));
        assert_eq!(reply.reply_to, Some(request_id));
        assert_eq!(reply.data, Some(Value::Text("hi".into())));
        assert_eq!(reply.sender_id, server_id);
        assert_eq!(reply.target_id, Some(client_id));
    }

    #[tokio::test]
    async fn unregister_is_exact_and_idempotent() {
        let (client, server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        let tx_a = tx.clone();
        let keep = server.observe("news", move |_| {
            let tx = tx_a.clone();
            async move {
                tx.send("kept").unwrap();
                Ok(())
            }
        });
        let tx_b = tx.clone();
        let dropped = server.observe("news", move |_| {
            let tx = tx_b.clone();
            async move {
                tx.send("dropped").unwrap();
                Ok(())
            }
        });
        assert_eq!(server.handler_count("news"), 2);

        dropped.unregister();
        dropped.unregister(); // no-op
        assert_eq!(server.handler_count("news"), 1);

        client.start();
        server.start();
        client.send(Message::new("news", None)).await.unwrap();
        assert_eq!(rx.recv().await, Some("kept"));
        assert!(rx.try_recv().is_err());

        keep.unregister();
        assert_eq!(server.handler_count("news"), 0);
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately_and_unregisters() {
        let (client, server) = socket_pair();
        client.start();
        server.start();

        let request = Message::new("slow", None);
        let reply_channel = Message::reply_channel("slow", request.message_id);
        let result = client.send_request_timeout(request, Duration::ZERO).await;
        assert!(matches!(result, Err(DuplexError::Timeout)));
        assert_eq!(client.handler_count(&reply_channel), 0);
    }

    #[tokio::test]
    async fn timeout_when_no_handler_replies() {
        let (client, server) = socket_pair();
        client.start();
        server.start();

        let request = Message::new("slow", None);
        let reply_channel = Message::reply_channel("slow", request.message_id);
        let started = std::time::Instant::now();
        let result = client
            .send_request_timeout(request, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(DuplexError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.handler_count(&reply_channel), 0);
    }

    #[tokio::test]
    async fn gate_drops_messages() {
        let (client, server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        server.observe("open", {
            let tx = tx.clone();
            move |m: Message| {
                let tx = tx.clone();
                async move {
                    tx.send(m.channel).unwrap();
                    Ok(())
                }
            }
        });
        server.observe("blocked", move |m: Message| {
            let tx = tx.clone();
            async move {
                tx.send(m.channel).unwrap();
                Ok(())
            }
        });
        server.set_gate(Arc::new(|message: &Message| message.channel != "blocked"));
        client.start();
        server.start();

        client.send(Message::new("blocked", None)).await.unwrap();
        client.send(Message::new("open", None)).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("open"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_handler_synthesizes_reply_for_responding_handlers() {
        let (client, server) = socket_pair();
        server.handle("boom", |_message: Message| async move {
            Err::<Option<Message>, _>(DuplexError::Handler("kaput".into()))
        });
        server.set_error_handler(Arc::new(|request: &Message, error: &DuplexError| {
            Some(Message::reply(
                request,
                Some(Value::Map(vec![
                    (Value::Text("Success".into()), Value::Bool(false)),
                    (Value::Text("Message".into()), Value::Text(error.to_string())),
                ])),
            ))
        }));
        client.start();
        server.start();

        let reply = client
            .send_request_timeout(Message::new("boom", None), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            reply.data_entry("Success").and_then(|v| v.as_bool()),
            Some(false)
        );
    }

    #[tokio::test]
    async fn handler_errors_do_not_kill_the_loop() {
        let (client, server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<u64>();
        server.observe_sync("fail", |_m| Err(DuplexError::Handler("nope".into())));
        server.observe("ok", move |_m| {
            let tx = tx.clone();
            async move {
                tx.send(1).unwrap();
                Ok(())
            }
        });
        client.start();
        server.start();

        client.send(Message::new("fail", None)).await.unwrap();
        client.send(Message::new("ok", None)).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));
    }

    #[tokio::test]
    async fn single_channel_dispatch_preserves_arrival_order() {
        let (client, server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<i128>();
        server.observe("seq", move |m: Message| {
            let tx = tx.clone();
            async move {
                let n = m
                    .data
                    .as_ref()
                    .and_then(|v| v.as_integer())
                    .map(i128::from)
                    .unwrap_or(-1);
                tx.send(n).unwrap();
                Ok(())
            }
        });
        client.start();
        server.start();

        for n in 0..16i64 {
            client
                .send(Message::new("seq", Some(Value::Integer(n.into()))))
                .await
                .unwrap();
        }
        for n in 0..16i128 {
            assert_eq!(rx.recv().await, Some(n));
        }
    }

    #[tokio::test]
    async fn typed_event_dispatch() {
        let (client, _server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();
        client.on_event_typed::<Uuid, _, _>(EventKind::ClientIdReceived, move |id| {
            let tx = tx.clone();
            async move {
                tx.send(id).unwrap();
            }
        });

        let id = Uuid::new_v4();
        client
            .broadcast_event(EventKind::ClientIdReceived, Arc::new(id))
            .await;
        // Mismatched payload type is skipped.
        client
            .broadcast_event(EventKind::ClientIdReceived, Arc::new("wrong"))
            .await;
        assert_eq!(rx.recv().await, Some(id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispose_resolves_pending_requests_as_timeout() {
        let (client, server) = socket_pair();
        client.start();
        server.start();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send_request_timeout(Message::new("void", None), Duration::from_millis(300))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.dispose().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(DuplexError::Timeout)));
    }

    #[tokio::test]
    async fn peer_close_fires_disconnected_event_once() {
        let (client, server) = socket_pair();
        let (tx, mut rx) = mpsc::unbounded_channel::<ConnectionStatus>();
        client.on_event_typed::<ConnectionStatus, _, _>(
            EventKind::ConnectionStatusChanged,
            move |status| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(status);
                }
            },
        );
        client.start();
        server.start();

        server.dispose().await;
        assert_eq!(rx.recv().await, Some(ConnectionStatus::Disconnected));
        // The loop is down and no further status is delivered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
