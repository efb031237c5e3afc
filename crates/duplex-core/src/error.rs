use thiserror::Error;

/// Errors produced by the duplex protocol layer.
#[derive(Debug, Error)]
pub enum DuplexError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("client not connected: {0}")]
    ClientNotConnected(uuid::Uuid),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for DuplexError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        DuplexError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for DuplexError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        DuplexError::Codec(e.to_string())
    }
}

pub type DuplexResult<T> = Result<T, DuplexError>;
