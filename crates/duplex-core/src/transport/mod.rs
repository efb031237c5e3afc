//! Transport abstraction: a full-duplex stream of framed messages.
//!
//! Two implementations cover the supported wire shapes:
//!
//! - [`StreamTransport`]: length-prefixed frames over plain TCP or TLS.
//! - [`WsTransport`]: one binary WebSocket message per logical message.
//!
//! Both enforce the read/write discipline: a single reader, and a write lock
//! covering each framed message as a unit.

pub mod stream;
pub mod tls;
pub mod ws;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{DuplexError, DuplexResult};
use crate::message::Message;
use crate::status::ConnectionStatus;

pub use stream::{Dialer, StreamTransport};
pub use tls::TlsClientOptions;
pub use ws::WsTransport;

/// Object-safe alias for the byte streams transports run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A boxed byte stream (TCP, TLS, or an in-memory pipe in tests).
pub type BoxedStream = Box<dyn AsyncStream>;

/// A framed, full-duplex message stream over one connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Client-initiated dial with retry. Server-accepted transports are
    /// pre-connected and reject this with a configuration error.
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> DuplexResult<()>;

    /// Encode and write one message. Concurrent callers serialize on the
    /// per-stream write lock; frames never interleave.
    async fn send(&self, message: &Message) -> DuplexResult<()>;

    /// Pull the next inbound message. `Ok(None)` means orderly close. While
    /// the link is still being set up the call waits instead of reading
    /// partial bytes. Single-consumer.
    async fn recv(&self) -> DuplexResult<Option<Message>>;

    /// Emit the `Authenticated` status. No stream effect.
    fn on_authenticated(&self);

    /// Idempotent teardown: cancels the in-flight read, releases the stream,
    /// emits `Disconnected` exactly once.
    async fn close(&self);

    fn is_connected(&self) -> bool;

    /// Subscribe to connection-status changes.
    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus>;
}

/// Link lifecycle shared by the transport implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkState {
    /// Constructed but never dialed.
    Idle,
    Connected,
    Closed,
}

/// Dial with exponential backoff: `base_delay * 2^(attempt - 1)` between
/// attempts. Emits `Connecting`/`Reconnecting` on entry and
/// `Failed`/`Cancelled` on the failure paths; the caller emits the success
/// status once the link is installed. Configuration errors short-circuit.
pub(crate) async fn dial_with_backoff<T, F, Fut>(
    dial: F,
    max_retries: u32,
    base_delay: Duration,
    state: watch::Receiver<LinkState>,
    status: &broadcast::Sender<ConnectionStatus>,
    reconnect: bool,
) -> DuplexResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DuplexResult<T>>,
{
    let _ = status.send(if reconnect {
        ConnectionStatus::Reconnecting
    } else {
        ConnectionStatus::Connecting
    });

    let max_attempts = max_retries.max(1);
    let mut attempt: u32 = 1;
    loop {
        match dial().await {
            Ok(link) => return Ok(link),
            Err(e @ DuplexError::Config(_)) => {
                let _ = status.send(ConnectionStatus::Failed);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                let _ = status.send(ConnectionStatus::Failed);
                return Err(DuplexError::ConnectFailed(format!(
                    "giving up after {attempt} attempts: {e}"
                )));
            }
            Err(e) => {
                let delay = base_delay.saturating_mul(2u32.saturating_pow(attempt - 1));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "dial failed, backing off"
                );
                let mut state = state.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = state.wait_for(|s| *s == LinkState::Closed) => {
                        let _ = status.send(ConnectionStatus::Cancelled);
                        return Err(DuplexError::Cancelled);
                    }
                }
                attempt += 1;
            }
        }
    }
}
