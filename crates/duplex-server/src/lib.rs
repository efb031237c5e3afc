//! duplex-server: server endpoint for the duplex messaging framework.
//!
//! A [`DuplexServer`] accepts connections over TCP, TLS, or WebSocket,
//! wraps each one in a per-client message socket, runs the authentication
//! gate, and routes broadcasts and targeted sends through the client
//! registry.
//!
//! # Quick Start
//!
//! ```no_run
//! use duplex_server::{AuthContext, DuplexServer, ServerConfig};
//! use duplex_core::Message;
//!
//! # async fn example() -> duplex_core::DuplexResult<()> {
//! let server = DuplexServer::bind(ServerConfig::default()).await?;
//!
//! server.set_auth_handler(|id, key, _scope| async move {
//!     if key == "wonderland" {
//!         AuthContext::granted(id, ["user"], None::<String>)
//!     } else {
//!         AuthContext::denied(false)
//!     }
//! });
//!
//! server.handle("echo", |message: Message| async move {
//!     Ok(Some(Message::reply(&message, message.data.clone())))
//! });
//!
//! server.start();
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connected;
mod listener;
pub mod server;

pub use auth::{AuthContext, AuthStatus};
pub use config::{ServerConfig, TransportKind};
pub use connected::ConnectedClient;
pub use server::DuplexServer;

// Re-export core types commonly needed alongside the server.
pub use duplex_core::{
    ConnectionStatus, DuplexError, DuplexResult, EventKind, Message, Registration,
};
