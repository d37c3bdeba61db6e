use serde::{Deserialize, Serialize};

/// Why a connection attempt failed or an established connection dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Network,
    AuthRejected,
    ProtocolMismatch,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => f.write_str("network"),
            Self::AuthRejected => f.write_str("auth_rejected"),
            Self::ProtocolMismatch => f.write_str("protocol_mismatch"),
        }
    }
}

/// Transport-level failures. Always force the connection to `Disconnected`.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl TransportError {
    pub fn reason(&self) -> DisconnectReason {
        match self {
            Self::Network(_) => DisconnectReason::Network,
            Self::AuthRejected(_) => DisconnectReason::AuthRejected,
            Self::ProtocolMismatch(_) => DisconnectReason::ProtocolMismatch,
        }
    }

    /// Only plain network failures are worth another attempt; the server
    /// will keep rejecting a bad credential or an incompatible handshake.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Classify an HTTP status returned instead of a protocol upgrade.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::AuthRejected(format!("status {status}: {body}")),
            500..=599 => Self::Network(format!("status {status}: {body}")),
            _ => Self::ProtocolMismatch(format!("unexpected status {status}: {body}")),
        }
    }
}

/// A frame the protocol layer could not interpret. Non-fatal.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unrecognized frame type: {0}")]
    UnknownTag(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownTag(_) => "unknown_tag",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Errors from connection manager operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("not connected")]
    NotConnected,
}

/// Errors returned synchronously from session commands.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("not connected")]
    NotConnected,
    #[error("session is closed")]
    SessionClosed,
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl CommandError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::NotConnected => "not_connected",
            Self::SessionClosed => "session_closed",
            Self::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }
}

impl From<ConnectionError> for CommandError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InvalidEndpoint(msg) => Self::InvalidEndpoint(msg),
            ConnectionError::NotConnected => Self::NotConnected,
        }
    }
}
