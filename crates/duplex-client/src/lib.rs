//! duplex-client: client endpoint for the duplex messaging framework.
//!
//! A [`DuplexClient`] owns one transport and one message socket. It dials
//! the server (TCP, TLS, or WebSocket), performs the authentication
//! handshake on the reserved channel, and exposes the socket's handler
//! registration and request/response surface.
//!
//! # Quick Start
//!
//! ```no_run
//! use duplex_client::{ClientConfig, DuplexClient};
//! use duplex_core::Message;
//! use ciborium::value::Value;
//!
//! # async fn example() -> duplex_core::DuplexResult<()> {
//! let client = DuplexClient::tcp("127.0.0.1:4350", ClientConfig::default());
//! client.connect().await?;
//!
//! if client.authenticate("alice", "wonderland", None).await? {
//!     let reply = client
//!         .send_request(Message::new("echo", Some(Value::Text("hi".into()))))
//!         .await?;
//!     println!("{:?}", reply.data);
//! }
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;

pub use client::DuplexClient;
pub use config::ClientConfig;

// Re-export core types commonly needed alongside the client.
pub use duplex_core::{
    ConnectionStatus, DuplexError, DuplexResult, EventKind, Message, Registration,
};
pub use duplex_core::transport::TlsClientOptions;
