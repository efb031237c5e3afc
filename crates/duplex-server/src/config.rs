//! Server configuration: defaults, plus an optional TOML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use duplex_core::framing::DEFAULT_MAX_FRAME_LEN;
use duplex_core::{DuplexError, DuplexResult};

/// Which listener the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    WebSocket,
    WebSocketTls,
}

impl TransportKind {
    fn parse(s: &str) -> DuplexResult<Self> {
        match s {
            "tcp" => Ok(TransportKind::Tcp),
            "tls" => Ok(TransportKind::Tls),
            "ws" => Ok(TransportKind::WebSocket),
            "wss" => Ok(TransportKind::WebSocketTls),
            other => Err(DuplexError::Config(format!(
                "unknown transport kind: {other} (expected tcp, tls, ws, or wss)"
            ))),
        }
    }

    /// Whether this listener terminates TLS.
    pub fn uses_tls(self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::WebSocketTls)
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
struct ServerSection {
    #[serde(default = "default_bind")]
    bind: String,
    #[serde(default = "default_transport")]
    transport: String,
    #[serde(default)]
    cert: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default = "default_max_frame_len")]
    max_frame_len: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            transport: default_transport(),
            cert: None,
            key: None,
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
struct AuthSection {
    #[serde(default)]
    disallow_anonymous: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            disallow_anonymous: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:4350".to_string()
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_max_frame_len() -> u32 {
    DEFAULT_MAX_FRAME_LEN
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listener bind address, `host:port`.
    pub bind_addr: String,
    /// Listener flavor.
    pub transport: TransportKind,
    /// TLS certificate PEM path. Required for the TLS listeners.
    pub cert_path: Option<PathBuf>,
    /// TLS private key PEM path. Required for the TLS listeners.
    pub key_path: Option<PathBuf>,
    /// Reject every non-auth message from unauthenticated clients.
    pub disallow_anonymous: bool,
    /// Maximum accepted frame length in bytes.
    pub max_frame_len: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind(),
            transport: TransportKind::Tcp,
            cert_path: None,
            key_path: None,
            disallow_anonymous: false,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(config_path: Option<&Path>) -> DuplexResult<Self> {
        let file = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| DuplexError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile {
                    server: ServerSection::default(),
                    auth: AuthSection::default(),
                }
            }
            None => ConfigFile {
                server: ServerSection::default(),
                auth: AuthSection::default(),
            },
        };

        let transport = TransportKind::parse(&file.server.transport)?;
        let config = Self {
            bind_addr: file.server.bind,
            transport,
            cert_path: file.server.cert.map(PathBuf::from),
            key_path: file.server.key.map(PathBuf::from),
            disallow_anonymous: file.auth.disallow_anonymous,
            max_frame_len: file.server.max_frame_len,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency; TLS listeners require a certificate.
    pub fn validate(&self) -> DuplexResult<()> {
        if self.transport.uses_tls() && (self.cert_path.is_none() || self.key_path.is_none()) {
            return Err(DuplexError::Config(
                "TLS listener requires cert and key paths".into(),
            ));
        }
        Ok(())
    }
}
