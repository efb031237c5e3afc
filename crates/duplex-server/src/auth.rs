//! Authentication records for connected clients.
//!
//! The handshake verdict comes from the embedding application's auth
//! handler; this module holds the resulting per-client context and the
//! role/scope checks the access-control guards build on.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use ciborium::value::Value;

/// Handshake lifecycle of one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No handshake attempted yet.
    Anonymous,
    Authenticating,
    Authenticated,
    Failed,
}

/// The per-client authentication record established by the handshake.
///
/// Created empty on accept, replaced atomically on a successful handshake,
/// never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub roles: HashSet<String>,
    pub scope: Option<String>,
    pub success: bool,
    /// When `false` on a failed handshake, the connection is closed right
    /// after the failure reply.
    pub connection_allowed: bool,
    /// Application-defined session payload.
    pub session_data: Option<Value>,
}

impl AuthContext {
    /// A successful context for `user_id` with the given roles.
    pub fn granted<R, S>(user_id: impl Into<String>, roles: R, scope: Option<S>) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        S: Into<String>,
    {
        Self {
            user_id: Some(user_id.into()),
            roles: roles.into_iter().map(Into::into).collect(),
            scope: scope.map(Into::into),
            success: true,
            connection_allowed: true,
            session_data: None,
        }
    }

    /// A failed context. `connection_allowed` controls whether the client
    /// may stay connected after the failure reply.
    pub fn denied(connection_allowed: bool) -> Self {
        Self {
            connection_allowed,
            ..Self::default()
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// `None` means unconstrained.
    pub fn scope_matches(&self, scope: Option<&str>) -> bool {
        match scope {
            None => true,
            Some(scope) => self.scope.as_deref() == Some(scope),
        }
    }
}

/// Boxed future returned by an [`AuthHandler`].
pub type AuthFuture = Pin<Box<dyn Future<Output = AuthContext> + Send>>;

/// Application hook producing the handshake verdict from `(id, key, scope)`.
pub type AuthHandler =
    Arc<dyn Fn(String, String, Option<String>) -> AuthFuture + Send + Sync>;
