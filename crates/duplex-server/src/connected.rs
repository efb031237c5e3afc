//! One connected client: a message socket plus the authentication gate.
//!
//! Construction pre-registers the handshake handler on the reserved
//! `"_auth_"` channel and, when anonymous traffic is disallowed, installs a
//! per-message gate that drops everything else until the handshake
//! succeeds.

use std::sync::{Arc, Mutex, MutexGuard};

use ciborium::value::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use duplex_core::transport::Transport;
use duplex_core::{
    ConnectionStatus, DuplexError, DuplexResult, EventKind, Message, MessageSocket,
    AUTH_CHANNEL,
};

use crate::auth::{AuthContext, AuthHandler, AuthStatus};

pub(crate) struct AuthState {
    status: Mutex<AuthStatus>,
    context: Mutex<Option<Arc<AuthContext>>>,
}

impl AuthState {
    fn new() -> Self {
        Self {
            status: Mutex::new(AuthStatus::Anonymous),
            context: Mutex::new(None),
        }
    }

    fn set_status(&self, status: AuthStatus) {
        *lock(&self.status) = status;
    }

    fn status(&self) -> AuthStatus {
        *lock(&self.status)
    }

    /// Store the successful context and flip to `Authenticated` atomically
    /// with respect to readers of the context.
    fn install(&self, context: Arc<AuthContext>) {
        *lock(&self.context) = Some(context);
        self.set_status(AuthStatus::Authenticated);
    }

    fn context(&self) -> Option<Arc<AuthContext>> {
        lock(&self.context).clone()
    }

    fn is_authenticated(&self) -> bool {
        self.status() == AuthStatus::Authenticated
            && self.context().is_some_and(|ctx| ctx.success)
    }
}

/// A client connection held by the server.
pub struct ConnectedClient {
    id: Uuid,
    socket: MessageSocket,
    auth: Arc<AuthState>,
}

impl ConnectedClient {
    pub(crate) fn new(
        id: Uuid,
        transport: Arc<dyn Transport>,
        auth_handler: Option<AuthHandler>,
        error_handler: Option<duplex_core::ErrorHandler>,
        disallow_anonymous: bool,
    ) -> Arc<Self> {
        let socket = MessageSocket::new(transport.clone());
        if let Some(handler) = error_handler {
            socket.set_error_handler(handler);
        }

        let auth = Arc::new(AuthState::new());

        // Anonymous rejection is evaluated per message: the handshake is the
        // only channel that passes before authentication succeeds.
        if disallow_anonymous {
            let gate_auth = auth.clone();
            socket.set_gate(Arc::new(move |message: &Message| {
                message.channel == AUTH_CHANNEL || gate_auth.is_authenticated()
            }));
        }

        Self::register_auth_handler(&socket, &auth, transport, auth_handler);

        Arc::new(Self { id, socket, auth })
    }

    fn register_auth_handler(
        socket: &MessageSocket,
        auth: &Arc<AuthState>,
        transport: Arc<dyn Transport>,
        auth_handler: Option<AuthHandler>,
    ) {
        let auth = auth.clone();
        let reply_socket = socket.clone();
        socket.handle(AUTH_CHANNEL, move |message: Message| {
            let auth = auth.clone();
            let transport = transport.clone();
            let auth_handler = auth_handler.clone();
            let socket = reply_socket.clone();
            async move {
                auth.set_status(AuthStatus::Authenticating);
                socket
                    .broadcast_event(
                        EventKind::ConnectionStatusChanged,
                        Arc::new(ConnectionStatus::Authenticating),
                    )
                    .await;

                let id = message
                    .data_entry("Id")
                    .and_then(|v| v.as_text())
                    .unwrap_or_default()
                    .to_string();
                let key = message
                    .data_entry("Key")
                    .and_then(|v| v.as_text())
                    .unwrap_or_default()
                    .to_string();
                let scope = message
                    .data_entry("Scope")
                    .and_then(|v| v.as_text())
                    .map(str::to_string);

                let context = match &auth_handler {
                    Some(handler) => handler(id.clone(), key, scope).await,
                    None => {
                        warn!("authentication attempted but no auth handler is configured");
                        AuthContext::denied(true)
                    }
                };

                let success = context.success;
                let connection_allowed = context.connection_allowed;
                if success {
                    auth.install(Arc::new(context));
                    transport.on_authenticated();
                    info!(user = %id, "client authenticated");
                } else {
                    auth.set_status(AuthStatus::Failed);
                    info!(user = %id, connection_allowed, "authentication failed");
                }

                let reply = Message::reply(
                    &message,
                    Some(Value::Map(vec![(
                        Value::Text("Success".into()),
                        Value::Bool(success),
                    )])),
                );

                if !success && !connection_allowed {
                    // Deliver the verdict, then drop the connection.
                    socket.send_reply(reply, &message).await?;
                    transport.close().await;
                    return Ok(None);
                }
                Ok(Some(reply))
            }
        });
    }

    /// The server-assigned client identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying message socket; use it to register per-client
    /// handlers or send targeted messages.
    pub fn socket(&self) -> &MessageSocket {
        &self.socket
    }

    pub fn auth_status(&self) -> AuthStatus {
        self.auth.status()
    }

    /// The context established by the handshake, if any.
    pub fn auth_context(&self) -> Option<Arc<AuthContext>> {
        self.auth.context()
    }

    // ── Access-control guards ──────────────────────────────────────────

    /// Fails unless the handshake succeeded.
    pub fn require_authenticated(&self) -> DuplexResult<()> {
        self.authenticated_context().map(|_| ())
    }

    /// Fails unless authenticated with `role` (and `scope`, when given).
    pub fn require_role(&self, role: &str, scope: Option<&str>) -> DuplexResult<()> {
        let ctx = self.authenticated_context()?;
        if !ctx.has_role(role) {
            return Err(DuplexError::Unauthorized(format!("role '{role}' required")));
        }
        if !ctx.scope_matches(scope) {
            return Err(DuplexError::Unauthorized(format!(
                "scope '{}' required",
                scope.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Disjunctive guard: at least one of `roles` and at least one of
    /// `scopes` must match. `None` means unconstrained.
    pub fn require_any(
        &self,
        roles: Option<&[&str]>,
        scopes: Option<&[&str]>,
    ) -> DuplexResult<()> {
        let ctx = self.authenticated_context()?;
        if let Some(roles) = roles {
            if !roles.iter().any(|role| ctx.has_role(role)) {
                return Err(DuplexError::Unauthorized(format!(
                    "one of roles {roles:?} required"
                )));
            }
        }
        if let Some(scopes) = scopes {
            if !scopes.iter().any(|scope| ctx.scope_matches(Some(*scope))) {
                return Err(DuplexError::Unauthorized(format!(
                    "one of scopes {scopes:?} required"
                )));
            }
        }
        Ok(())
    }

    /// Conjunctive guard: every listed role and scope must match. `None`
    /// means unconstrained.
    pub fn require_all(
        &self,
        roles: Option<&[&str]>,
        scopes: Option<&[&str]>,
    ) -> DuplexResult<()> {
        let ctx = self.authenticated_context()?;
        if let Some(roles) = roles {
            if let Some(missing) = roles.iter().find(|role| !ctx.has_role(role)) {
                return Err(DuplexError::Unauthorized(format!(
                    "role '{missing}' required"
                )));
            }
        }
        if let Some(scopes) = scopes {
            if let Some(missing) = scopes
                .iter()
                .find(|scope| !ctx.scope_matches(Some(**scope)))
            {
                return Err(DuplexError::Unauthorized(format!(
                    "scope '{missing}' required"
                )));
            }
        }
        Ok(())
    }

    fn authenticated_context(&self) -> DuplexResult<Arc<AuthContext>> {
        match self.auth.context() {
            Some(ctx) if self.auth.status() == AuthStatus::Authenticated && ctx.success => Ok(ctx),
            _ => {
                debug!(client_id = %self.id, "guard rejected unauthenticated caller");
                Err(DuplexError::Unauthorized("authentication required".into()))
            }
        }
    }

    /// Send a message to this client.
    pub async fn send(&self, message: Message) -> DuplexResult<()> {
        self.socket.send(message).await
    }

    /// Tear the connection down. Idempotent.
    pub async fn dispose(&self) {
        self.socket.dispose().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::codec::{CborCodec, MessageCodec};
    use duplex_core::framing::DEFAULT_MAX_FRAME_LEN;
    use duplex_core::transport::StreamTransport;

    fn idle_client() -> Arc<ConnectedClient> {
        // A transport that never connects is enough for guard tests.
        let codec: Arc<dyn MessageCodec> = Arc::new(CborCodec);
        let (a, _b) = tokio::io::duplex(1024);
        let transport: Arc<dyn Transport> = Arc::new(StreamTransport::accepted(
            Box::new(a),
            codec,
            DEFAULT_MAX_FRAME_LEN,
        ));
        ConnectedClient::new(Uuid::new_v4(), transport, None, None, false)
    }

    fn authenticate(client: &ConnectedClient, ctx: AuthContext) {
        client.auth.install(Arc::new(ctx));
    }

    #[test]
    fn guards_reject_anonymous_callers() {
        let client = idle_client();
        assert!(matches!(
            client.require_authenticated(),
            Err(DuplexError::Unauthorized(_))
        ));
        assert!(client.require_role("admin", None).is_err());
        assert!(client.require_any(Some(&["admin"]), None).is_err());
        assert!(client.require_all(None, None).is_err());
    }

    #[test]
    fn role_and_scope_guards() {
        let client = idle_client();
        authenticate(
            &client,
            AuthContext::granted("alice", ["admin", "ops"], Some("tenant-1")),
        );

        assert!(client.require_authenticated().is_ok());
        assert!(client.require_role("admin", None).is_ok());
        assert!(client.require_role("admin", Some("tenant-1")).is_ok());
        assert!(client.require_role("admin", Some("tenant-2")).is_err());
        assert!(client.require_role("root", None).is_err());

        assert!(client.require_any(Some(&["root", "ops"]), None).is_ok());
        assert!(client.require_any(Some(&["root"]), None).is_err());
        assert!(client
            .require_any(None, Some(&["tenant-1", "tenant-9"]))
            .is_ok());

        assert!(client.require_all(Some(&["admin", "ops"]), None).is_ok());
        assert!(client.require_all(Some(&["admin", "root"]), None).is_err());
        assert!(client.require_all(None, Some(&["tenant-1"])).is_ok());
        assert!(client.require_all(None, None).is_ok());
    }

    #[test]
    fn failed_context_is_not_authenticated() {
        let client = idle_client();
        // A denied context must not pass the guards even if installed.
        client.auth.install(Arc::new(AuthContext::denied(true)));
        assert!(client.require_authenticated().is_err());
    }
}
