use std::fmt;

/// Connection-lifecycle states reported by a transport's status observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Reconnected,
    Disconnected,
    Authenticating,
    Authenticated,
    Failed,
    Cancelled,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Reconnected => "reconnected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Authenticating => "authenticating",
            ConnectionStatus::Authenticated => "authenticated",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
