use std::any::Any;
use std::sync::Arc;

/// Kinds of events delivered through a socket's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Carries a [`crate::ConnectionStatus`].
    ConnectionStatusChanged,
    /// Carries the server-assigned client [`uuid::Uuid`].
    ClientIdReceived,
}

/// Type-erased event payload. Typed subscribers downcast it before dispatch.
pub type EventArg = Arc<dyn Any + Send + Sync>;
