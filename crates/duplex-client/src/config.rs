//! Client connection configuration.

use std::time::Duration;

use duplex_core::framing::DEFAULT_MAX_FRAME_LEN;
use duplex_core::socket::DEFAULT_REQUEST_TIMEOUT;

/// Configuration for connecting to a duplex server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Dial attempts before `connect` gives up.
    pub max_retries: u32,
    /// Base delay for exponential backoff between attempts.
    pub base_delay: Duration,
    /// Timeout applied to `send_request` and the auth handshake.
    pub request_timeout: Duration,
    /// Maximum accepted frame length in bytes.
    pub max_frame_len: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}
