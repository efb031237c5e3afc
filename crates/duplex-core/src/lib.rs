//! duplex-core: shared protocol library for the duplex messaging framework.
//!
//! Provides the wire message model, the pluggable CBOR codec, length-prefixed
//! and WebSocket transports, and the per-connection [`MessageSocket`] that
//! both endpoints build on: handler registration, the inbound dispatch loop,
//! reply correlation, and connection-lifecycle events.

pub mod codec;
pub mod error;
pub mod event;
pub mod framing;
pub mod message;
pub mod socket;
pub mod status;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{CborCodec, MessageCodec};
pub use error::{DuplexError, DuplexResult};
pub use event::{EventArg, EventKind};
pub use message::{Message, AUTH_CHANNEL, CLIENT_ID_CHANNEL};
pub use socket::{ErrorHandler, MessageGate, MessageSocket, Registration, DEFAULT_REQUEST_TIMEOUT};
pub use status::ConnectionStatus;
pub use transport::{BoxedStream, Transport};
